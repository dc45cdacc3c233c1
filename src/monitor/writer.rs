//! Background writer for mid-session saves.
//!
//! Serializing the session and syncing it to disk costs time proportional to
//! the session length, which the capture thread cannot spend between reads.
//! The pipeline hands a [`SessionDocument`] snapshot to this thread instead.
//! The writer owns the path of the file it last wrote, so each save replaces
//! the one before it.

use crate::logger::{Event, SharedLogger};
use crate::stats::persist::{write_session, SessionDocument};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

pub struct SessionWriter {
    sender: Sender<SessionDocument>,
    handle: JoinHandle<Option<PathBuf>>,
}

impl SessionWriter {
    /// Spawns the writer thread. It exits once every queued snapshot is
    /// handled and the writer has been [`finish`](Self::finish)ed.
    pub fn spawn(dir: PathBuf, logger: SharedLogger) -> Self {
        let (sender, receiver) = mpsc::channel::<SessionDocument>();

        let handle = thread::spawn(move || {
            let mut last: Option<PathBuf> = None;

            while let Ok(mut doc) = receiver.recv() {
                // Snapshots are cumulative; only the newest one needs writing.
                while let Ok(newer) = receiver.try_recv() {
                    doc = newer;
                }

                match write_session(&dir, &doc, last.as_deref()) {
                    Ok(path) => {
                        logger.log(&Event::SessionSaved {
                            path:    &path.display().to_string(),
                            seconds: doc.per_second.len(),
                        });
                        last = Some(path);
                    }
                    Err(e) => logger.log(&Event::SessionSaveFailed {
                        dir:   &dir.display().to_string(),
                        error: &e.to_string(),
                    }),
                }
            }
            last
        });

        Self { sender, handle }
    }

    /// Queues a snapshot for writing. Returns `false` if the writer thread is
    /// gone.
    pub fn submit(&self, doc: SessionDocument) -> bool {
        self.sender.send(doc).is_ok()
    }

    /// Waits for queued snapshots to be written and returns the file the
    /// writer left on disk, if any.
    pub fn finish(self) -> Option<PathBuf> {
        drop(self.sender);
        self.handle.join().ok().flatten()
    }
}
