mod merge_pipeline;
