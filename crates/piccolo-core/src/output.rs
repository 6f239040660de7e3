//! Output writer, consuming completed [`SpectraList`] batches off a queue
//! and writing them to the data directory with collision-avoiding names.
//!
//! Runs on its own worker thread, following the generic task/result queue
//! shape every worker in this crate shares, keeping all disk I/O confined
//! to this one thread rather than the coordinator.

use std::fs;
use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, warn};

use crate::message::MessageBus;
use crate::spectrum::SpectraList;

/// One item submitted to the output writer: a completed cycle's spectra
/// plus the run subdirectory to write it under.
pub struct OutputJob {
    pub run_dir: PathBuf,
    pub list: SpectraList,
}

/// Write policy.
#[derive(Debug, Clone, Copy)]
pub struct OutputPolicy {
    pub clobber: bool,
    pub split: bool,
    pub pretty: bool,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        OutputPolicy {
            clobber: false,
            split: false,
            pretty: false,
        }
    }
}

/// Handle used to submit batches to a running output writer.
#[derive(Clone)]
pub struct OutputHandle {
    jobs: Sender<Option<OutputJob>>,
}

impl OutputHandle {
    pub fn submit(&self, run_dir: PathBuf, list: SpectraList) {
        let _ = self.jobs.send(Some(OutputJob { run_dir, list }));
    }

    /// Sentinel shutdown.
    pub fn stop(&self) {
        let _ = self.jobs.send(None);
    }
}

/// Render one [`Spectrum`] slice as the canonical `.pico` JSON payload.
fn render(spectra: &[crate::spectrum::Spectrum], seq_nr: u32, pretty: bool) -> serde_json::Result<String> {
    let payload = serde_json::json!({
        "Spectra": spectra,
        "SequenceNumber": seq_nr,
    });
    if pretty {
        serde_json::to_string_pretty(&payload)
    } else {
        serde_json::to_string(&payload)
    }
}

/// Filenames sharing `prefix` but with `seq` bumped, one per entry in
/// `suffixes` (e.g. `[""]` for a single file, `["_light", "_dark"]` for a
/// split write). Both files of a split pair always carry the same `seq`.
fn names_at(prefix: &str, seq: u32, suffixes: &[&str]) -> Vec<String> {
    let base = format!("{prefix}{seq:06}.pico");
    suffixes.iter().map(|suf| format!("{base}{suf}")).collect()
}

/// Find the lowest `seq >= start` at which none of the target filenames
/// already exist under `run_dir`. `clobber = true` always returns `start`
/// unchanged.
fn next_free_seq(run_dir: &std::path::Path, prefix: &str, start: u32, suffixes: &[&str], clobber: bool) -> u32 {
    if clobber {
        return start;
    }
    let mut seq = start;
    loop {
        let collides = names_at(prefix, seq, suffixes)
            .iter()
            .any(|name| run_dir.join(name).exists());
        if !collides {
            return seq;
        }
        seq += 1;
    }
}

fn write_job(job: OutputJob, policy: OutputPolicy, bus: &Option<MessageBus>) {
    if let Err(e) = fs::create_dir_all(&job.run_dir) {
        error!("output writer: failed to create {}: {e}", job.run_dir.display());
        return;
    }

    let suffixes: &[&str] = if policy.split { &["_light", "_dark"] } else { &[""] };
    let seq = next_free_seq(&job.run_dir, job.list.prefix(), job.list.seq_nr(), suffixes, policy.clobber);
    if seq != job.list.seq_nr() {
        bus_warn(
            bus,
            format!(
                "output name at seq {} already existed, writing seq {} instead",
                job.list.seq_nr(),
                seq
            ),
        );
    }

    if policy.split {
        let (light, dark) = job.list.split_by_dark();
        for (suffix, spectra) in [("_light", light), ("_dark", dark)] {
            if spectra.is_empty() {
                continue;
            }
            let contents = match render(&spectra, seq, policy.pretty) {
                Ok(c) => c,
                Err(e) => {
                    error!("output writer: failed to serialize {suffix} spectra: {e}");
                    continue;
                }
            };
            let path = job.run_dir.join(format!("{}{suffix}", names_at(job.list.prefix(), seq, &[""])[0]));
            if let Err(e) = fs::write(&path, &contents) {
                error!("output writer: failed to write {suffix} file: {e}");
            }
        }
    } else {
        let contents = match render(job.list.spectra(), seq, policy.pretty) {
            Ok(c) => c,
            Err(e) => {
                error!("output writer: failed to serialize spectra: {e}");
                return;
            }
        };
        let path = job.run_dir.join(&names_at(job.list.prefix(), seq, &[""])[0]);
        if let Err(e) = fs::write(&path, &contents) {
            error!("output writer: failed to write output file: {e}");
        }
    }
}

fn bus_warn(bus: &Option<MessageBus>, message: String) {
    if let Some(bus) = bus {
        bus.warning(message);
    }
}

/// Spawn the output writer thread, blocking on the spectra queue. Errors
/// during write are logged and dropped; they never stop the writer.
pub fn spawn(policy: OutputPolicy, bus: Option<MessageBus>) -> OutputHandle {
    let (tx, rx): (Sender<Option<OutputJob>>, Receiver<Option<OutputJob>>) = unbounded();
    thread::Builder::new()
        .name("piccolo-output".into())
        .spawn(move || {
            for job in rx {
                match job {
                    Some(job) => write_job(job, policy, &bus),
                    None => {
                        warn!("output writer stopping");
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn output writer thread");
    OutputHandle { jobs: tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{Direction, Spectrum};
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_list(prefix: &str, seq: u32) -> SpectraList {
        let mut list = SpectraList::new(prefix, seq);
        let mut s = Spectrum::new(vec![1.0, 2.0, 3.0]);
        s.stamp(Direction::Upwelling, false, chrono::Utc::now(), "S_A");
        list.push(s);
        list
    }

    #[test]
    fn writes_single_file_by_default() {
        let dir = tempdir().unwrap();
        let handle = spawn(OutputPolicy::default(), None);
        let run_dir = dir.path().join("run1");
        handle.submit(run_dir.clone(), sample_list("b000000_s", 0));
        handle.stop();
        thread::sleep(Duration::from_millis(100));
        let path = run_dir.join("b000000_s000000.pico");
        assert!(path.exists());
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.contains("SequenceNumber"));
    }

    #[test]
    fn collision_avoidance_increments_rather_than_overwrites() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("run1");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("b000000_s000000.pico"), "existing").unwrap();

        let bus = MessageBus::spawn();
        let listener = bus.new_listener();
        let policy = OutputPolicy {
            clobber: false,
            ..OutputPolicy::default()
        };
        let handle = spawn(policy, Some(bus.clone()));
        handle.submit(run_dir.clone(), sample_list("b000000_s", 0));
        handle.stop();
        thread::sleep(Duration::from_millis(100));

        let original = fs::read_to_string(run_dir.join("b000000_s000000.pico")).unwrap();
        assert_eq!(original, "existing", "original file must not be overwritten");
        assert!(run_dir.join("b000000_s000001.pico").exists());
        assert!(bus.status(listener));
    }

    #[test]
    fn collision_avoidance_skips_past_multiple_existing_seqs() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("run1");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("b000000_s000000.pico"), "existing0").unwrap();
        fs::write(run_dir.join("b000000_s000001.pico"), "existing1").unwrap();

        let handle = spawn(OutputPolicy::default(), None);
        handle.submit(run_dir.clone(), sample_list("b000000_s", 0));
        handle.stop();
        thread::sleep(Duration::from_millis(100));

        assert!(run_dir.join("b000000_s000002.pico").exists());
    }

    #[test]
    fn clobber_true_overwrites() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("run1");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("b000000_s000000.pico"), "existing").unwrap();

        let policy = OutputPolicy {
            clobber: true,
            ..OutputPolicy::default()
        };
        let handle = spawn(policy, None);
        handle.submit(run_dir.clone(), sample_list("b000000_s", 0));
        handle.stop();
        thread::sleep(Duration::from_millis(100));

        let contents = fs::read_to_string(run_dir.join("b000000_s000000.pico")).unwrap();
        assert_ne!(contents, "existing");
    }

    #[test]
    fn split_writes_light_and_dark_separately() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("run1");
        let mut list = SpectraList::new("b000000_s", 0);
        let mut dark = Spectrum::new(vec![0.0]);
        dark.stamp(Direction::Upwelling, true, chrono::Utc::now(), "S_A");
        let mut light = Spectrum::new(vec![1.0]);
        light.stamp(Direction::Upwelling, false, chrono::Utc::now(), "S_A");
        list.push(dark);
        list.push(light);

        let policy = OutputPolicy {
            split: true,
            ..OutputPolicy::default()
        };
        let handle = spawn(policy, None);
        handle.submit(run_dir.clone(), list);
        handle.stop();
        thread::sleep(Duration::from_millis(100));

        assert!(run_dir.join("b000000_s000000.pico_light").exists());
        assert!(run_dir.join("b000000_s000000.pico_dark").exists());
    }
}
