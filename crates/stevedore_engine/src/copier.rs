//! Copy worker: one file's copy-and-verify pipeline.
//!
//! The worker never touches durable state. It returns exactly one outcome;
//! the scheduler translates that outcome into a queue-store transition.

use crate::cancel::CancellationToken;
use crate::hash::{hash_file, ContentHasher};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use stevedore_protocol::defaults::CANCELLED_MESSAGE;
use stevedore_protocol::HashAlgorithm;

/// Input for one copy job, taken from a claimed queue entry.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub file_size: u64,
    /// Replace an existing destination instead of comparing against it.
    /// Set only for rows requeued by an overwrite resolution.
    pub overwrite: bool,
}

/// Terminal outcome of one copy job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Streamed copy finished and the destination verified.
    Completed { hash: String },
    /// Destination already existed with identical content; nothing written.
    Identical { hash: String },
    /// Destination already existed with different content; nothing written.
    Conflict {
        source_hash: String,
        destination_hash: String,
    },
    /// Post-copy verification failed; the destination was unlinked.
    IntegrityError {
        source_hash: String,
        destination_hash: String,
    },
    /// Read/write failure or cancellation; any partial destination was
    /// unlinked best-effort.
    Error { message: String },
}

/// Copy one file with streaming hash verification.
///
/// `progress` receives the cumulative byte count after every chunk; the
/// caller owns any throttling policy. Cancellation is honored at chunk
/// boundaries and behaves like an error with the destination removed.
pub fn copy_file(
    request: &CopyRequest,
    algorithm: HashAlgorithm,
    buffer_size: usize,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(u64),
) -> CopyOutcome {
    let source = &request.source_path;
    let destination = &request.destination_path;

    if let Some(parent) = destination.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            return CopyOutcome::Error {
                message: format!("{}: {err}", parent.display()),
            };
        }
    }

    // Pre-existing destination: compare content instead of copying.
    // Existing destinations are never modified unless resolution
    // explicitly requested an overwrite.
    if !request.overwrite && destination.exists() {
        let (source_hash, destination_hash) = std::thread::scope(|scope| {
            let dest_task = scope.spawn(|| hash_file(destination, algorithm, buffer_size));
            let source_hash = hash_file(source, algorithm, buffer_size);
            let destination_hash = match dest_task.join() {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::other("destination hashing panicked")),
            };
            (source_hash, destination_hash)
        });

        let source_hash = match source_hash {
            Ok(hash) => hash,
            Err(err) => {
                return CopyOutcome::Error {
                    message: format!("{}: {err}", source.display()),
                }
            }
        };
        let destination_hash = match destination_hash {
            Ok(hash) => hash,
            Err(err) => {
                return CopyOutcome::Error {
                    message: format!("{}: {err}", destination.display()),
                }
            }
        };

        if source_hash == destination_hash {
            return CopyOutcome::Identical { hash: source_hash };
        }
        return CopyOutcome::Conflict {
            source_hash,
            destination_hash,
        };
    }

    // Fresh destination: single pass read -> hash -> write.
    let mut reader = match File::open(source) {
        Ok(file) => file,
        Err(err) => {
            return CopyOutcome::Error {
                message: format!("{}: {err}", source.display()),
            }
        }
    };
    let mut writer = match File::create(destination) {
        Ok(file) => file,
        Err(err) => {
            return CopyOutcome::Error {
                message: format!("{}: {err}", destination.display()),
            }
        }
    };

    let mut hasher = ContentHasher::new(algorithm);
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut bytes_copied: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            drop(writer);
            let _ = fs::remove_file(destination);
            return CopyOutcome::Error {
                message: CANCELLED_MESSAGE.to_string(),
            };
        }

        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                drop(writer);
                let _ = fs::remove_file(destination);
                return CopyOutcome::Error {
                    message: format!("{}: {err}", source.display()),
                };
            }
        };
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
        if let Err(err) = writer.write_all(&buf[..n]) {
            drop(writer);
            let _ = fs::remove_file(destination);
            return CopyOutcome::Error {
                message: format!("{}: {err}", destination.display()),
            };
        }

        bytes_copied += n as u64;
        progress(bytes_copied);
    }

    if let Err(err) = writer.flush() {
        drop(writer);
        let _ = fs::remove_file(destination);
        return CopyOutcome::Error {
            message: format!("{}: {err}", destination.display()),
        };
    }
    drop(writer);

    let source_hash = hasher.finish();
    progress(bytes_copied);

    // Verify by re-reading what actually landed on disk.
    let destination_hash = match hash_file(destination, algorithm, buffer_size) {
        Ok(hash) => hash,
        Err(err) => {
            let _ = fs::remove_file(destination);
            return CopyOutcome::Error {
                message: format!("{}: {err}", destination.display()),
            };
        }
    };

    if destination_hash != source_hash {
        let _ = fs::remove_file(destination);
        return CopyOutcome::IntegrityError {
            source_hash,
            destination_hash,
        };
    }

    CopyOutcome::Completed { hash: source_hash }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request(tmp: &tempfile::TempDir, name: &str, content: &[u8]) -> CopyRequest {
        let source_path = tmp.path().join("src").join(name);
        fs::create_dir_all(source_path.parent().unwrap()).unwrap();
        fs::write(&source_path, content).unwrap();
        CopyRequest {
            source_path,
            destination_path: tmp.path().join("dst").join(name),
            file_size: content.len() as u64,
            overwrite: false,
        }
    }

    fn run(request: &CopyRequest) -> CopyOutcome {
        copy_file(
            request,
            HashAlgorithm::Xxhash3,
            8 * 1024,
            &CancellationToken::new(),
            &mut |_| {},
        )
    }

    #[test]
    fn copies_and_verifies_new_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(&tmp, "nested/dir/a.txt", b"hello, world.");

        let outcome = run(&req);
        let CopyOutcome::Completed { hash } = outcome else {
            panic!("expected completed, got {outcome:?}");
        };
        assert!(!hash.is_empty());
        assert_eq!(fs::read(&req.destination_path).unwrap(), b"hello, world.");
    }

    #[test]
    fn identical_destination_is_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(&tmp, "a.txt", b"same bytes");
        fs::create_dir_all(req.destination_path.parent().unwrap()).unwrap();
        fs::write(&req.destination_path, b"same bytes").unwrap();

        let before = fs::metadata(&req.destination_path).unwrap().modified().unwrap();
        let outcome = run(&req);
        let after = fs::metadata(&req.destination_path).unwrap().modified().unwrap();

        assert!(matches!(outcome, CopyOutcome::Identical { .. }));
        assert_eq!(before, after);
    }

    #[test]
    fn divergent_destination_reports_conflict_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(&tmp, "a.txt", b"source content");
        fs::create_dir_all(req.destination_path.parent().unwrap()).unwrap();
        fs::write(&req.destination_path, b"older content").unwrap();

        let outcome = run(&req);
        let CopyOutcome::Conflict {
            source_hash,
            destination_hash,
        } = outcome
        else {
            panic!("expected conflict");
        };
        assert_ne!(source_hash, destination_hash);
        assert_eq!(fs::read(&req.destination_path).unwrap(), b"older content");
    }

    #[test]
    fn overwrite_mode_replaces_existing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let mut req = request(&tmp, "a.txt", b"fresh content");
        req.overwrite = true;
        fs::create_dir_all(req.destination_path.parent().unwrap()).unwrap();
        fs::write(&req.destination_path, b"stale content").unwrap();

        let outcome = run(&req);
        assert!(matches!(outcome, CopyOutcome::Completed { .. }));
        assert_eq!(fs::read(&req.destination_path).unwrap(), b"fresh content");
    }

    #[test]
    fn missing_source_is_an_error_without_partial_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let req = CopyRequest {
            source_path: tmp.path().join("src/definitely-missing.bin"),
            destination_path: tmp.path().join("dst/definitely-missing.bin"),
            file_size: 0,
            overwrite: false,
        };

        let outcome = run(&req);
        assert!(matches!(outcome, CopyOutcome::Error { .. }));
        assert!(!req.destination_path.exists());
    }

    #[test]
    fn cancellation_unlinks_partial_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(&tmp, "big.bin", &vec![1u8; 64 * 1024]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = copy_file(
            &req,
            HashAlgorithm::Xxhash3,
            4 * 1024,
            &cancel,
            &mut |_| {},
        );

        let CopyOutcome::Error { message } = outcome else {
            panic!("expected error outcome");
        };
        assert_eq!(message, CANCELLED_MESSAGE);
        assert!(!req.destination_path.exists());
    }

    #[test]
    fn progress_is_monotonic_and_reaches_total() {
        let tmp = tempfile::tempdir().unwrap();
        let content = vec![9u8; 40_000];
        let req = request(&tmp, "p.bin", &content);

        let mut samples = Vec::new();
        let outcome = copy_file(
            &req,
            HashAlgorithm::Xxhash64,
            8 * 1024,
            &CancellationToken::new(),
            &mut |bytes| samples.push(bytes),
        );

        assert!(matches!(outcome, CopyOutcome::Completed { .. }));
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*samples.last().unwrap(), content.len() as u64);
    }

    #[test]
    fn empty_file_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(&tmp, "empty.txt", b"");

        let outcome = run(&req);
        assert!(matches!(outcome, CopyOutcome::Completed { .. }));
        assert_eq!(fs::read(&req.destination_path).unwrap().len(), 0);
    }
}
