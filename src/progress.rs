use crate::protocol::EraseProgress;
use log::trace;
use std::io;
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// Time between progress polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consecutive polls without forward progress before giving up.
pub const STALL_LIMIT: u32 = 10;

/// Polls an operation's progress until it reports [EraseProgress::Done]. Only stalled time is
/// bounded: as long as progress moves forward at least once every `stall_limit` polls, waiting
/// continues indefinitely.
#[derive(Copy, Clone, Debug)]
pub struct ProgressMonitor {
    pub interval: Duration,
    pub stall_limit: u32,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            stall_limit: STALL_LIMIT,
        }
    }
}

impl ProgressMonitor {
    /// Call `poll` until it reports completion, sleeping between polls. `report` sees each
    /// forward step and the final [EraseProgress::Done].
    pub fn wait(
        &self,
        mut poll: impl FnMut() -> io::Result<EraseProgress>,
        mut report: impl FnMut(EraseProgress),
    ) -> Result<(), Error> {
        let mut last = 0u8;
        let mut stalled = 0u32;

        loop {
            let progress = poll().map_err(Error::Poll)?;
            trace!("Progress poll: {progress}");

            match progress {
                EraseProgress::Done => {
                    report(progress);
                    return Ok(());
                }
                EraseProgress::Percent(p) if p < last => {
                    return Err(Error::WentBackwards {
                        previous: last,
                        current: p,
                    });
                }
                EraseProgress::Percent(p) if p > last => {
                    last = p;
                    stalled = 0;
                    report(progress);
                }
                EraseProgress::Percent(_) => {
                    stalled += 1;
                    if stalled >= self.stall_limit {
                        return Err(Error::TimedOut {
                            progress: last,
                            polls: stalled,
                        });
                    }
                }
            }

            sleep(self.interval);
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("unable to read progress")]
    Poll(#[source] io::Error),

    #[error("progress went backwards ({previous}% -> {current}%)")]
    WentBackwards { previous: u8, current: u8 },

    #[error("timed out: no progress past {progress}% in {polls} polls")]
    TimedOut { progress: u8, polls: u32 },
}
