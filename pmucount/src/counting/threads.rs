//! Thread enumeration from /proc
//!
//! A tracked process usually already has threads when tracking starts; they
//! never pass through `task_newtask` again, so they are seeded up front.

use std::fs;
use std::io;
use std::path::Path;

use crate::domain::{CountingError, Pid, Tid};

/// Thread ids of `pid` under the proc mount `proc_root`, ascending
///
/// # Errors
/// [`CountingError::ProcessNotFound`] if the process does not exist.
pub fn list_threads_in(proc_root: &Path, pid: Pid) -> Result<Vec<Tid>, CountingError> {
    let task_dir = proc_root.join(pid.0.to_string()).join("task");
    let entries = match fs::read_dir(&task_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CountingError::ProcessNotFound(pid));
        }
        Err(e) => return Err(e.into()),
    };

    // threads exiting mid-scan simply drop out
    let mut tids: Vec<Tid> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_name().to_str()?.parse::<u32>().ok().map(Tid)
        })
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// # Errors
/// See [`list_threads_in`].
pub fn list_threads(pid: Pid) -> Result<Vec<Tid>, CountingError> {
    list_threads_in(Path::new("/proc"), pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_proc_tree() {
        let proc_root = tempfile::tempdir().unwrap();
        for tid in ["42", "44", "43"] {
            fs::create_dir_all(proc_root.path().join("42/task").join(tid)).unwrap();
        }
        fs::create_dir_all(proc_root.path().join("42/task/not-a-tid")).unwrap();

        let tids = list_threads_in(proc_root.path(), Pid(42)).unwrap();
        assert_eq!(tids, vec![Tid(42), Tid(43), Tid(44)]);
    }

    #[test]
    fn test_missing_process() {
        let proc_root = tempfile::tempdir().unwrap();
        assert!(matches!(
            list_threads_in(proc_root.path(), Pid(7)),
            Err(CountingError::ProcessNotFound(Pid(7)))
        ));
    }

    #[test]
    fn test_self_has_a_thread() {
        let tids = list_threads(Pid(std::process::id())).unwrap();
        assert!(tids.contains(&Tid(std::process::id())));
    }
}
