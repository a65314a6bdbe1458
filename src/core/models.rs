use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct RunDirs {
    pub run_id: String,
    pub root: PathBuf,     // <runs>/<run_id>
    pub evidence: PathBuf, // skill out-dir
    pub log_file: PathBuf, // records.jsonl
    pub summary_file: PathBuf,
}
