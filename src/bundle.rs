use crate::arsc::ResourceTable;
use crate::error::{MergeError, MergeResult};
use crate::find_apk_files;
use crate::module::{ApkModule, MANIFEST_ENTRY, TABLE_ENTRY};
use log::{debug, info};
use std::path::Path;

/// A directory of split APK modules, loaded and ready to merge.
pub struct ApkBundle {
    modules: Vec<ApkModule>,
}

impl ApkBundle {
    /// Discover `*.apk` files under `dir` (recursively when asked) and load
    /// each into a module. Fails with [`MergeError::NoModulesFound`] when
    /// the directory yields none.
    pub fn load_directory(dir: impl AsRef<Path>, recursive: bool) -> MergeResult<Self> {
        let dir = dir.as_ref();
        let files = find_apk_files(dir, recursive)?;
        if files.is_empty() {
            return Err(MergeError::NoModulesFound(dir.to_path_buf()));
        }
        let mut modules = Vec::with_capacity(files.len());
        for file in files {
            modules.push(ApkModule::from_file(&file)?);
        }
        info!("loaded {} modules from {}", modules.len(), dir.display());
        Ok(ApkBundle { modules })
    }

    pub fn from_modules(modules: Vec<ApkModule>) -> Self {
        ApkBundle { modules }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|module| module.name()).collect()
    }

    /// Merge all modules into one, consuming the bundle.
    ///
    /// One module is elected base (launcher activity first, then a manifest
    /// without a `split` attribute, then load order) and every other
    /// module's archive entries and resource packages are folded into it.
    /// Entry path collisions are base-wins; table collisions raise
    /// [`MergeError::ResourceConflict`] when `validate` is set and are
    /// base-wins otherwise. Split APKs should not define overlapping ids by
    /// construction, so validation exists to catch malformed split sets
    /// early.
    pub fn merge_modules(mut self, validate: bool) -> MergeResult<ApkModule> {
        if self.modules.is_empty() {
            return Err(MergeError::NoModulesFound(Path::new(".").to_path_buf()));
        }
        let base_index = self.elect_base_index();
        let mut base = self.modules.remove(base_index);
        info!("base module: '{}'", base.name());

        let splits_with_tables = self
            .modules
            .iter()
            .any(|module| module.archive().contains(TABLE_ENTRY));
        if base.has_table() {
            base.ensure_table()?;
        } else if splits_with_tables {
            base.table = Some(ResourceTable::new());
        }

        for mut module in self.modules {
            debug!("folding module '{}'", module.name());
            if module.archive().contains(TABLE_ENTRY) {
                module.ensure_table()?;
                if let (Some(base_table), Some(split_table)) = (&mut base.table, &module.table) {
                    base_table.merge_from(split_table, validate)?;
                }
            }
            for (name, entry) in module.archive.into_entries() {
                // Split manifests are dropped; the split table was merged
                // into the base model above.
                if name == MANIFEST_ENTRY || name == TABLE_ENTRY {
                    continue;
                }
                let inserted = base.archive.put_if_absent(&name, entry)?;
                if !inserted {
                    debug!("keeping base copy of colliding entry '{name}'");
                }
            }
        }
        Ok(base)
    }

    fn elect_base_index(&mut self) -> usize {
        for (idx, module) in self.modules.iter_mut().enumerate() {
            if module.has_manifest() {
                if let Ok(manifest) = module.manifest() {
                    if manifest.has_launchable_activity() {
                        return idx;
                    }
                }
            }
        }
        for (idx, module) in self.modules.iter_mut().enumerate() {
            if module.is_base_module() {
                return idx;
            }
        }
        0
    }
}
