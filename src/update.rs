use crate::firmware_file::FirmwareFile;
use crate::progress::{self, ProgressMonitor};
use crate::protocol::{ControlChannel, EraseProgress, ProtocolVersion, REQUIRED_PROTOCOL_MAJOR};
use log::{debug, info, trace};
use std::fmt::Display;
use thiserror::Error;

/// Top-level operations that change device state. Each one ends by rebooting the device.
#[derive(Debug)]
pub enum Operation {
    /// Reboot only.
    Reboot,
    /// Reset configuration to factory defaults, then reboot.
    ResetConfig,
    /// Reset configuration and erase the upgrade firmware, leaving the factory firmware, then
    /// reboot.
    EraseFirmware,
    /// Reset configuration, erase the upgrade firmware, write the given firmware, then reboot.
    Update(FirmwareFile),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Reboot => "reboot",
            Operation::ResetConfig => "reset-config",
            Operation::EraseFirmware => "erase-firmware",
            Operation::Update(_) => "update",
        }
    }

    fn resets_config(&self) -> bool {
        !matches!(self, Operation::Reboot)
    }

    fn erases_firmware(&self) -> bool {
        matches!(self, Operation::EraseFirmware | Operation::Update(_))
    }
}

/// Where a session is in its command sequence. Transitions only move forward, in declaration
/// order, except that any state may move to [UpdateState::Failed].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    ConfigReset,
    FirmwareErase,
    FirmwareWrite,
    Rebooting,
    Complete,
    Failed,
}

impl Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            UpdateState::Idle => "idle",
            UpdateState::ConfigReset => "configuration reset",
            UpdateState::FirmwareErase => "firmware erase",
            UpdateState::FirmwareWrite => "firmware write",
            UpdateState::Rebooting => "reboot",
            UpdateState::Complete => "complete",
            UpdateState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Things a caller may want to show while a session runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateEvent {
    State(UpdateState),
    /// Forward step of the erase belonging to the given state.
    Erase(UpdateState, EraseProgress),
    Write { written: usize, total: usize },
}

impl UpdateEvent {
    /// Percentage for [UpdateEvent::Write].
    pub fn write_percent(written: usize, total: usize) -> u8 {
        if total == 0 {
            return 100;
        }
        (written as u64 * 100 / total as u64) as u8
    }
}

/// One open device, exclusively owned for the duration of one [Operation]. Dropping the session
/// releases the device, whichever way the operation ends.
pub struct UpdateSession<C: ControlChannel> {
    channel: C,
    monitor: ProgressMonitor,
    protocol: ProtocolVersion,
    state: UpdateState,
    destructive_applied: bool,
}

impl<C: ControlChannel> UpdateSession<C> {
    /// Take ownership of an opened device and check that it speaks a protocol version we
    /// support. No command is sent if it doesn't.
    pub fn open(mut channel: C, monitor: ProgressMonitor) -> Result<Self, Error> {
        let protocol = channel
            .protocol_version()
            .map_err(|source| Error::DeviceIo {
                source,
                action: "reading protocol version",
            })?;

        if !protocol.is_supported() {
            return Err(Error::UnsupportedProtocol(protocol));
        }
        debug!("Device protocol version {protocol}");

        Ok(Self {
            channel,
            monitor,
            protocol,
            state: UpdateState::Idle,
            destructive_applied: false,
        })
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Run `operation` to completion. Nothing is retried: the first failure ends the session in
    /// [UpdateState::Failed] and the error reports the state it failed in.
    pub fn run(
        mut self,
        operation: Operation,
        mut on_event: impl FnMut(UpdateEvent),
    ) -> Result<(), SessionError> {
        info!("Starting {}", operation.name());
        match self.sequence(&operation, &mut on_event) {
            Ok(()) => {
                info!("{} complete", operation.name());
                Ok(())
            }
            Err(error) => {
                let state = self.state;
                self.state = UpdateState::Failed;
                on_event(UpdateEvent::State(UpdateState::Failed));
                Err(SessionError {
                    operation: operation.name(),
                    state,
                    destructive_applied: self.destructive_applied,
                    error,
                })
            }
        }
    }

    fn sequence(
        &mut self,
        operation: &Operation,
        on_event: &mut impl FnMut(UpdateEvent),
    ) -> Result<(), Error> {
        if operation.resets_config() {
            self.enter(UpdateState::ConfigReset, on_event);
            self.channel
                .erase_config()
                .map_err(|source| Error::DeviceIo {
                    source,
                    action: "resetting configuration",
                })?;
            self.destructive_applied = true;
            self.wait_for_erase(on_event)?;
        }

        if operation.erases_firmware() {
            self.enter(UpdateState::FirmwareErase, on_event);
            self.channel
                .erase_firmware()
                .map_err(|source| Error::DeviceIo {
                    source,
                    action: "erasing upgrade firmware",
                })?;
            self.wait_for_erase(on_event)?;
        }

        if let Operation::Update(firmware) = operation {
            self.enter(UpdateState::FirmwareWrite, on_event);
            self.write(firmware.payload(), on_event)?;
        }

        self.enter(UpdateState::Rebooting, on_event);
        self.channel.reboot().map_err(|source| Error::DeviceIo {
            source,
            action: "rebooting device",
        })?;

        self.enter(UpdateState::Complete, on_event);
        Ok(())
    }

    fn enter(&mut self, state: UpdateState, on_event: &mut impl FnMut(UpdateEvent)) {
        debug!("{} -> {}", self.state, state);
        self.state = state;
        on_event(UpdateEvent::State(state));
    }

    fn wait_for_erase(&mut self, on_event: &mut impl FnMut(UpdateEvent)) -> Result<(), Error> {
        let state = self.state;
        let channel = &mut self.channel;
        self.monitor.wait(
            || channel.erase_progress(),
            |progress| on_event(UpdateEvent::Erase(state, progress)),
        )?;
        Ok(())
    }

    fn write(&mut self, payload: &[u8], on_event: &mut impl FnMut(UpdateEvent)) -> Result<(), Error> {
        let total = payload.len();
        let mut offset = 0;

        while offset < total {
            let remaining = total - offset;
            let accepted = self
                .channel
                .write_firmware_chunk(&payload[offset..])
                .map_err(|source| Error::DeviceIo {
                    source,
                    action: "writing firmware",
                })?;

            if accepted == 0 {
                return Err(Error::WriteStalled { offset, total });
            }
            if accepted > remaining {
                return Err(Error::WriteOverrun {
                    accepted,
                    remaining,
                });
            }

            offset += accepted;
            trace!("Wrote {accepted} bytes, {offset}/{total}");
            on_event(UpdateEvent::Write {
                written: offset,
                total,
            });
        }

        Ok(())
    }
}

/// Failure partway through an [Operation].
#[derive(Error, Debug)]
#[error("{operation} failed during {state}")]
pub struct SessionError {
    pub operation: &'static str,
    /// State the session was in when it failed.
    pub state: UpdateState,
    /// Whether configuration or firmware on the device had already been erased.
    pub destructive_applied: bool,
    #[source]
    pub error: Error,
}

impl SessionError {
    /// The destructive part of the operation went through but the reboot command didn't. The
    /// device must be power-cycled by hand to finish.
    pub fn needs_manual_reboot(&self) -> bool {
        self.state == UpdateState::Rebooting && self.destructive_applied
    }
}

/// Everything that can go wrong while talking to an open device.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(
        "unsupported protocol version {0}: this tool requires major version {major}",
        major = REQUIRED_PROTOCOL_MAJOR
    )]
    UnsupportedProtocol(ProtocolVersion),

    #[error("device I/O error while {action}")]
    DeviceIo {
        source: std::io::Error,
        action: &'static str,
    },

    #[error("erase did not complete")]
    Erase(#[from] progress::Error),

    #[error("device accepted no firmware data at offset {offset} of {total}")]
    WriteStalled { offset: usize, total: usize },

    #[error("device claimed to accept {accepted} bytes when only {remaining} were offered")]
    WriteOverrun { accepted: usize, remaining: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware_file::FirmwareHeader;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Command {
        EraseConfig,
        EraseFirmware,
        Write(usize),
        Reboot,
    }

    /// Scripted stand-in for a device.
    struct MockChannel {
        protocol: u32,
        log: Vec<Command>,
        progress: VecDeque<io::Result<EraseProgress>>,
        max_chunk: usize,
        written: Vec<u8>,
        fail_reboot: bool,
        fail_erase_firmware: bool,
        zero_write_after: Option<usize>,
        fail_write: bool,
        overrun_write: bool,
    }

    impl MockChannel {
        fn new() -> Self {
            Self {
                protocol: 0x01_00_00,
                log: vec![],
                progress: VecDeque::new(),
                max_chunk: 1000,
                written: vec![],
                fail_reboot: false,
                fail_erase_firmware: false,
                zero_write_after: None,
                fail_write: false,
                overrun_write: false,
            }
        }

        fn queue_erase(&mut self, readings: &[u8]) {
            for &r in readings {
                self.progress.push_back(Ok(EraseProgress::Percent(r)));
            }
            self.progress.push_back(Ok(EraseProgress::Done));
        }
    }

    impl ControlChannel for MockChannel {
        fn protocol_version(&mut self) -> io::Result<ProtocolVersion> {
            Ok(ProtocolVersion::from_raw(self.protocol))
        }

        fn reboot(&mut self) -> io::Result<()> {
            self.log.push(Command::Reboot);
            if self.fail_reboot {
                return Err(io::Error::other("no reply"));
            }
            Ok(())
        }

        fn erase_config(&mut self) -> io::Result<()> {
            self.log.push(Command::EraseConfig);
            Ok(())
        }

        fn erase_firmware(&mut self) -> io::Result<()> {
            self.log.push(Command::EraseFirmware);
            if self.fail_erase_firmware {
                return Err(io::Error::other("busy"));
            }
            Ok(())
        }

        fn erase_progress(&mut self) -> io::Result<EraseProgress> {
            self.progress
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::other("no erase in progress")))
        }

        fn write_firmware_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.zero_write_after.is_some_and(|n| self.written.len() >= n) {
                return Ok(0);
            }
            if self.fail_write {
                return Err(io::Error::other("broken pipe"));
            }
            if self.overrun_write {
                return Ok(data.len() + 1);
            }
            let n = data.len().min(self.max_chunk);
            self.written.extend_from_slice(&data[..n]);
            self.log.push(Command::Write(n));
            Ok(n)
        }
    }

    fn monitor() -> ProgressMonitor {
        ProgressMonitor {
            interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn firmware(payload: &[u8]) -> FirmwareFile {
        let header = FirmwareHeader::for_payload(0x1235, 0x8211, 1605, payload).unwrap();
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        FirmwareFile::read(&mut io::Cursor::new(bytes)).unwrap()
    }

    fn run(
        mock: &mut MockChannel,
        operation: Operation,
    ) -> (Result<(), SessionError>, Vec<UpdateEvent>) {
        let mut events = vec![];
        let session = UpdateSession::open(mock, monitor()).unwrap();
        let result = session.run(operation, |e| events.push(e));
        (result, events)
    }

    fn states(events: &[UpdateEvent]) -> Vec<UpdateState> {
        events
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::State(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wrong_major_version_sends_no_commands() {
        let mut mock = MockChannel::new();
        mock.protocol = 0x02_00_00;
        let result = UpdateSession::open(&mut mock, monitor());
        assert!(matches!(
            result,
            Err(Error::UnsupportedProtocol(ProtocolVersion { major: 2, .. }))
        ));
        assert!(mock.log.is_empty());
    }

    #[test]
    fn newer_minor_version_is_accepted() {
        let mut mock = MockChannel::new();
        mock.protocol = 0x01_07_02;
        let session = UpdateSession::open(&mut mock, monitor()).unwrap();
        assert_eq!(session.protocol_version().minor, 7);
        assert_eq!(session.state(), UpdateState::Idle);
    }

    #[test]
    fn reboot_only_reboots() {
        let mut mock = MockChannel::new();
        let (result, events) = run(&mut mock, Operation::Reboot);
        assert!(result.is_ok());
        assert_eq!(mock.log, vec![Command::Reboot]);
        assert_eq!(states(&events), vec![UpdateState::Rebooting, UpdateState::Complete]);
    }

    #[test]
    fn reset_config_sequence() {
        let mut mock = MockChannel::new();
        mock.queue_erase(&[0, 50, 100]);
        let (result, events) = run(&mut mock, Operation::ResetConfig);
        assert!(result.is_ok());
        assert_eq!(mock.log, vec![Command::EraseConfig, Command::Reboot]);
        assert_eq!(
            states(&events),
            vec![
                UpdateState::ConfigReset,
                UpdateState::Rebooting,
                UpdateState::Complete
            ]
        );
        assert!(events.contains(&UpdateEvent::Erase(
            UpdateState::ConfigReset,
            EraseProgress::Done
        )));
    }

    #[test]
    fn erase_firmware_sequence() {
        let mut mock = MockChannel::new();
        mock.queue_erase(&[20]);
        mock.queue_erase(&[20, 60]);
        let (result, _) = run(&mut mock, Operation::EraseFirmware);
        assert!(result.is_ok());
        assert_eq!(
            mock.log,
            vec![Command::EraseConfig, Command::EraseFirmware, Command::Reboot]
        );
        assert!(mock.progress.is_empty());
    }

    #[test]
    fn update_writes_whole_payload_in_order() {
        let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let mut mock = MockChannel::new();
        mock.queue_erase(&[10, 90]);
        mock.queue_erase(&[33, 66]);

        let (result, events) = run(&mut mock, Operation::Update(firmware(&payload)));
        assert!(result.is_ok());
        assert_eq!(mock.written, payload);
        assert_eq!(
            mock.log,
            vec![
                Command::EraseConfig,
                Command::EraseFirmware,
                Command::Write(1000),
                Command::Write(1000),
                Command::Write(500),
                Command::Reboot
            ]
        );

        let writes: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::Write { written, .. } => Some(*written),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![1000, 2000, 2500]);
        assert_eq!(UpdateEvent::write_percent(2000, 2500), 80);
        assert_eq!(
            states(&events),
            vec![
                UpdateState::ConfigReset,
                UpdateState::FirmwareErase,
                UpdateState::FirmwareWrite,
                UpdateState::Rebooting,
                UpdateState::Complete
            ]
        );
    }

    #[test]
    fn zero_byte_write_is_fatal() {
        let mut mock = MockChannel::new();
        mock.queue_erase(&[]);
        mock.queue_erase(&[]);
        mock.zero_write_after = Some(1000);

        let (result, events) = run(&mut mock, Operation::Update(firmware(&[7u8; 3000])));
        let err = result.unwrap_err();
        assert_eq!(err.state, UpdateState::FirmwareWrite);
        assert!(matches!(
            err.error,
            Error::WriteStalled {
                offset: 1000,
                total: 3000
            }
        ));
        assert!(!mock.log.contains(&Command::Reboot));
        assert_eq!(events.last(), Some(&UpdateEvent::State(UpdateState::Failed)));
    }

    #[test]
    fn write_error_is_fatal() {
        let mut mock = MockChannel::new();
        mock.queue_erase(&[]);
        mock.queue_erase(&[]);
        mock.fail_write = true;

        let (result, events) = run(&mut mock, Operation::Update(firmware(b"payload")));
        let err = result.unwrap_err();
        assert_eq!(err.state, UpdateState::FirmwareWrite);
        assert!(matches!(
            err.error,
            Error::DeviceIo {
                action: "writing firmware",
                ..
            }
        ));
        assert!(mock.written.is_empty());
        assert!(!mock.log.contains(&Command::Reboot));
        assert_eq!(events.last(), Some(&UpdateEvent::State(UpdateState::Failed)));
    }

    #[test]
    fn device_accepting_more_than_offered_is_fatal() {
        let mut mock = MockChannel::new();
        mock.queue_erase(&[]);
        mock.queue_erase(&[]);
        mock.overrun_write = true;

        let (result, _) = run(&mut mock, Operation::Update(firmware(b"payload")));
        let err = result.unwrap_err();
        assert_eq!(err.state, UpdateState::FirmwareWrite);
        assert!(matches!(
            err.error,
            Error::WriteOverrun {
                accepted: 8,
                remaining: 7
            }
        ));
        assert!(!mock.log.contains(&Command::Reboot));
    }

    #[test]
    fn unsupported_protocol_message_names_required_major() {
        let err = Error::UnsupportedProtocol(ProtocolVersion::from_raw(0x02_00_00));
        assert!(err.to_string().contains("requires major version 1"));
    }

    #[test]
    fn erase_going_backwards_aborts_before_write() {
        let mut mock = MockChannel::new();
        mock.progress.extend(
            [10, 25, 40, 30]
                .into_iter()
                .map(|p| Ok(EraseProgress::Percent(p))),
        );

        let (result, _) = run(&mut mock, Operation::Update(firmware(b"abc")));
        let err = result.unwrap_err();
        assert_eq!(err.state, UpdateState::ConfigReset);
        assert!(matches!(
            err.error,
            Error::Erase(progress::Error::WentBackwards {
                previous: 40,
                current: 30
            })
        ));
        assert_eq!(mock.log, vec![Command::EraseConfig]);
    }

    #[test]
    fn erase_command_failure_is_fatal() {
        let mut mock = MockChannel::new();
        mock.queue_erase(&[]);
        mock.fail_erase_firmware = true;

        let (result, _) = run(&mut mock, Operation::EraseFirmware);
        let err = result.unwrap_err();
        assert_eq!(err.state, UpdateState::FirmwareErase);
        assert!(err.destructive_applied);
        assert!(!err.needs_manual_reboot());
        assert!(matches!(err.error, Error::DeviceIo { .. }));
        assert_eq!(mock.log, vec![Command::EraseConfig, Command::EraseFirmware]);
    }

    #[test]
    fn failed_reboot_after_update_needs_manual_reboot() {
        let mut mock = MockChannel::new();
        mock.queue_erase(&[]);
        mock.queue_erase(&[]);
        mock.fail_reboot = true;

        let (result, _) = run(&mut mock, Operation::Update(firmware(b"payload")));
        let err = result.unwrap_err();
        assert_eq!(err.state, UpdateState::Rebooting);
        assert!(err.needs_manual_reboot());
        assert_eq!(mock.written, b"payload");
        // Reboot was attempted exactly once.
        assert_eq!(mock.log.iter().filter(|c| **c == Command::Reboot).count(), 1);
    }

    #[test]
    fn failed_plain_reboot_does_not_claim_applied_changes() {
        let mut mock = MockChannel::new();
        mock.fail_reboot = true;
        let (result, _) = run(&mut mock, Operation::Reboot);
        let err = result.unwrap_err();
        assert!(!err.needs_manual_reboot());
    }
}
