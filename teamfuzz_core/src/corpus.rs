use crate::coverage::COVERAGE_MARKER;
use crate::layout::{CampaignLayout, worker_name};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker AFL-style fuzzers keep in the names of imported original seeds.
pub const ORIGIN_MARKER: &str = "orig";

/// Errors raised while copying seeds or moving round artifacts around.
#[derive(Error, Debug)]
pub enum StagingError {
    /// The operator's corpus holds no seed files; the first round cannot start.
    #[error("Seed corpus {0} is missing or contains no files")]
    EmptyCorpus(String),

    /// A copy, move or directory operation failed.
    #[error("Staging I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StagingError + '_ {
    move |source| StagingError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Regular files directly inside `dir`, sorted by file name.
fn seed_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, StagingError> {
    let mut files = Vec::new();
    for entry_result in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry_result.map_err(io_error(dir))?;
        let path = entry.path();
        if path.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    files.sort();
    Ok(files)
}

/// Copies the operator's corpus into `dest`, keeping file names.
///
/// Fails with [`StagingError::EmptyCorpus`] if there is nothing to copy.
pub fn import_corpus(source: &Path, dest: &Path) -> Result<usize, StagingError> {
    if !source.is_dir() {
        return Err(StagingError::EmptyCorpus(source.display().to_string()));
    }
    fs::create_dir_all(dest).map_err(io_error(dest))?;
    let files = seed_files(source)?;
    if files.is_empty() {
        return Err(StagingError::EmptyCorpus(source.display().to_string()));
    }
    for (name, path) in &files {
        let target = dest.join(name);
        fs::copy(path, &target).map_err(io_error(&target))?;
    }
    log::info!("Imported {} seed(s) from {}", files.len(), source.display());
    Ok(files.len())
}

/// Copies this round's seeds from `source` into `staging` as `seed_1`,
/// `seed_2`, ... From round 2 on only coverage-increasing or original seeds
/// are taken. A missing `source` stages nothing.
pub fn stage_seeds(source: &Path, staging: &Path, round: u32) -> Result<usize, StagingError> {
    fs::create_dir_all(staging).map_err(io_error(staging))?;
    if !source.is_dir() {
        log::warn!("Seed source {} does not exist; staging nothing", source.display());
        return Ok(0);
    }
    let mut staged = 0;
    for (name, path) in seed_files(source)? {
        if round > 1 && !name.contains(COVERAGE_MARKER) && !name.contains(ORIGIN_MARKER) {
            continue;
        }
        staged += 1;
        let target = staging.join(format!("seed_{staged}"));
        fs::copy(&path, &target).map_err(io_error(&target))?;
    }
    log::debug!("Staged {staged} seed(s) from {} for round {round}", source.display());
    Ok(staged)
}

fn move_into(item: &Path, backup: &Path) -> Result<bool, StagingError> {
    let Some(file_name) = item.file_name() else {
        return Ok(false);
    };
    if !item.exists() {
        return Ok(false);
    }
    let target = backup.join(file_name);
    fs::rename(item, &target).map_err(io_error(item))?;
    Ok(true)
}

/// Moves the artifacts of `finished_round` into its backup directory: graph
/// dumps, task files, staged seeds, and every round worker's output
/// directory and log.
pub fn rotate_artifacts(
    layout: &CampaignLayout,
    finished_round: u32,
    round_workers: usize,
) -> Result<PathBuf, StagingError> {
    let backup = layout.backup_dir(finished_round);
    fs::create_dir_all(&backup).map_err(io_error(&backup))?;

    let mut items = vec![
        layout.callgraph_dot(),
        layout.callgraph_json(),
        layout.tasks(),
        layout.seeds(),
    ];
    for index in 1..=round_workers {
        let name = worker_name(index, finished_round, round_workers);
        items.push(layout.worker_dir(&name));
        items.push(layout.worker_log(&name));
    }

    let mut moved = 0;
    for item in &items {
        if move_into(item, &backup)? {
            moved += 1;
        }
    }
    log::debug!("Moved {moved} artifact(s) of round {finished_round} to {}", backup.display());
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), name.as_bytes()).unwrap();
    }

    #[test]
    fn import_copies_files_and_rejects_empty_corpus() {
        let temp_dir = tempdir().unwrap();
        let corpus = temp_dir.path().join("corpus");
        touch(&corpus, "a.png");
        touch(&corpus, "b.png");
        fs::create_dir(corpus.join("nested")).unwrap();
        let dest = temp_dir.path().join("seeds_origin");

        assert_eq!(import_corpus(&corpus, &dest).unwrap(), 2);
        assert_eq!(fs::read(dest.join("a.png")).unwrap(), b"a.png");

        let empty = temp_dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        assert!(matches!(
            import_corpus(&empty, &dest),
            Err(StagingError::EmptyCorpus(_))
        ));
        assert!(matches!(
            import_corpus(&temp_dir.path().join("absent"), &dest),
            Err(StagingError::EmptyCorpus(_))
        ));
    }

    #[test]
    fn later_rounds_stage_only_interesting_seeds() {
        let temp_dir = tempdir().unwrap();
        let queue = temp_dir.path().join("queue");
        touch(&queue, "id:000000,orig:a.png");
        touch(&queue, "id:000001,src:000000,op:havoc");
        touch(&queue, "id:000002,src:000000,op:flip1,+cov");

        let first = temp_dir.path().join("seeds1");
        assert_eq!(stage_seeds(&queue, &first, 1).unwrap(), 3);
        assert!(first.join("seed_3").is_file());

        let later = temp_dir.path().join("seeds2");
        assert_eq!(stage_seeds(&queue, &later, 2).unwrap(), 2);
        assert_eq!(fs::read(later.join("seed_1")).unwrap(), b"id:000000,orig:a.png");
        assert_eq!(
            fs::read(later.join("seed_2")).unwrap(),
            b"id:000002,src:000000,op:flip1,+cov"
        );
        assert!(!later.join("seed_3").exists());
    }

    #[test]
    fn missing_queue_stages_nothing() {
        let temp_dir = tempdir().unwrap();
        let staging = temp_dir.path().join("seeds");
        assert_eq!(stage_seeds(&temp_dir.path().join("nope"), &staging, 3).unwrap(), 0);
        assert!(staging.is_dir(), "Staging directory is created regardless");
    }

    #[test]
    fn rotation_moves_round_artifacts_into_backup() {
        let temp_dir = tempdir().unwrap();
        let layout = CampaignLayout::new(temp_dir.path());
        layout.create().unwrap();
        touch(&layout.seeds(), "seed_1");
        touch(&layout.tasks(), "task_1.txt");
        fs::write(layout.callgraph_dot(), "digraph {}").unwrap();
        // Round 2 with two round workers ran fuzzer_3 and fuzzer_4.
        touch(&layout.worker_dir("fuzzer_3"), "fuzzer_stats");
        fs::write(layout.worker_log("fuzzer_3"), "log").unwrap();
        touch(&layout.worker_dir("fuzzer_1"), "fuzzer_stats");

        let backup = rotate_artifacts(&layout, 2, 2).unwrap();

        assert_eq!(backup, temp_dir.path().join("backup_round_2"));
        assert!(backup.join("seeds/seed_1").is_file());
        assert!(backup.join("tasks/task_1.txt").is_file());
        assert!(backup.join("callgraph.dot").is_file());
        assert!(backup.join("fuzzer_3/fuzzer_stats").is_file());
        assert!(backup.join("fuzzer_3.log").is_file());
        assert!(!layout.seeds().exists());
        assert!(!layout.tasks().exists());
        assert!(
            layout.worker_dir("fuzzer_1").exists(),
            "Workers of other rounds stay in place"
        );
        assert!(layout.seeds_origin().is_dir());
    }
}
