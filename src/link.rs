use core::fmt;
use core::iter::FusedIterator;

use alloc::string::String;
use bilge::prelude::*;
use embedded_io::{Read, Write};
use log::{debug, error, trace, warn};

use crate::{
    Decode,
    config::LinkConfig,
    control::Control,
    frame::{Frame, FrameError, STX, latin1},
};

/// Largest chunk taken from the channel in one read.
pub const CHUNK_CAPACITY: usize = 1024;

type Chunk = heapless::Vec<u8, CHUNK_CAPACITY>;

/// The meter numbers its first frame 1, not 0.
const FIRST_RECNO: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    /// Receiving frames from the meter.
    DataMode,
    /// The meter sent EOT and is idle, but has not granted command mode yet.
    PreCommandMode,
    CommandMode,
}

#[derive(Debug)]
pub enum LinkError<E> {
    /// The channel failed a read or write. Fatal for the session.
    Transport(E),
    /// The meter kept sending frames that could not be accepted.
    Desync { rejects: u32 },
    /// A handshake or the data phase ran out of attempts.
    Timeout { state: LinkState, attempts: u32 },
}

impl<E: fmt::Debug> fmt::Display for LinkError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Transport(e) => write!(f, "channel failure: {:?}", e),
            LinkError::Desync { rejects } => {
                write!(f, "lost sync with meter after {} rejected frames", rejects)
            }
            LinkError::Timeout { state, attempts } => {
                write!(f, "no progress in {:?} after {} attempts", state, attempts)
            }
        }
    }
}

/// Drives the ENQ/ACK/EOT handshake over a half duplex channel.
///
/// Exactly one read follows every write. The framer owns the channel for
/// its whole life, only one sync or command may run at a time.
#[derive(Debug)]
pub struct Framer<C> {
    channel: C,
    recno: u3,
    state: LinkState,
    config: LinkConfig,
}

impl<C> Framer<C>
where
    C: Read + Write,
{
    pub fn new(channel: C) -> Framer<C> {
        Framer::with_config(channel, LinkConfig::default())
    }

    pub fn with_config(channel: C, config: LinkConfig) -> Framer<C> {
        Framer {
            channel,
            recno: u3::new(FIRST_RECNO),
            state: LinkState::Uninitialized,
            config,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Record number the next frame must carry.
    pub fn expected_recno(&self) -> u3 {
        self.recno
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Receive frames from the meter until it sends EOT.
    ///
    /// The first write of every sync is EOT, so calling this again starts a
    /// fresh conversation. Record numbering restarts at 1 with each sync.
    pub fn sync(&mut self) -> Payloads<'_, C> {
        self.recno = u3::new(FIRST_RECNO);
        Payloads {
            framer: self,
            reply: Control::Eot,
            rejects: 0,
            idle: 0,
            done: false,
        }
    }

    /// Bring the meter into remote command mode. Does nothing if it is
    /// already there.
    pub fn ensure_command(&mut self) -> Result<(), LinkError<C::Error>> {
        if self.state == LinkState::CommandMode {
            return Ok(());
        }
        if matches!(self.state, LinkState::Uninitialized | LinkState::DataMode) {
            // NAK whatever transfer is in progress until the meter gives up
            self.handshake(Control::Nak, Control::Eot)?;
            self.set_state(LinkState::PreCommandMode);
        }
        self.handshake(Control::Enq, Control::Ack)?;
        self.set_state(LinkState::CommandMode);
        Ok(())
    }

    /// Send one command and return its reply without the trailing ACK.
    ///
    /// `Ok(None)` means the meter did not acknowledge the command. An empty
    /// string is a successful reply with no content.
    pub fn command(&mut self, payload: &[u8]) -> Result<Option<String>, LinkError<C::Error>> {
        self.ensure_command()?;
        self.write_bytes(payload)?;
        let chunk = self.read_chunk()?;
        match chunk.split_last() {
            Some((&last, reply)) if last == Control::Ack.value() => Ok(Some(latin1(reply))),
            _ => {
                debug!("command {:02x?} was not acknowledged", payload);
                Ok(None)
            }
        }
    }

    fn handshake(&mut self, send: Control, until: Control) -> Result<(), LinkError<C::Error>> {
        let attempts = self.config.max_handshake_attempts;
        for _ in 0..attempts {
            self.send(send)?;
            let chunk = self.read_chunk()?;
            if Control::trailing(&chunk) == Some(until) {
                return Ok(());
            }
        }
        error!(
            "meter never answered {:?} with {:?} in {:?}",
            send, until, self.state
        );
        Err(LinkError::Timeout {
            state: self.state,
            attempts,
        })
    }

    /// Check the frame at the start of `data` against the expected record
    /// number. Only an accepted frame advances the sequence.
    fn accept(&mut self, data: &[u8]) -> Result<String, FrameError> {
        let frame = Frame::decode(data)?;
        if frame.recno() != self.recno {
            return Err(FrameError::SequenceMismatch {
                expected: self.recno,
                found: frame.recno(),
            });
        }
        self.recno = u3::new((self.recno.value() + 1) & 0b111);
        debug!("accepted frame {}", frame.recno().value());
        Ok(frame.payload())
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("link {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn send(&mut self, control: Control) -> Result<(), LinkError<C::Error>> {
        trace!("-> {:?}", control);
        self.write_bytes(&[control.value()])
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), LinkError<C::Error>> {
        self.channel.write_all(data).map_err(LinkError::Transport)?;
        self.channel.flush().map_err(LinkError::Transport)
    }

    fn read_chunk(&mut self) -> Result<Chunk, LinkError<C::Error>> {
        let mut chunk = Chunk::from([0; CHUNK_CAPACITY]);
        let n = self.channel.read(&mut chunk).map_err(LinkError::Transport)?;
        chunk.truncate(n);
        trace!("<- {:02x?}", chunk.as_slice());
        Ok(chunk)
    }
}

/// Payload texts of the frames received during one sync.
///
/// Ends when the meter sends EOT, or after yielding an error.
pub struct Payloads<'a, C>
where
    C: Read + Write,
{
    framer: &'a mut Framer<C>,
    /// Control code written before the next read.
    reply: Control,
    rejects: u32,
    idle: u32,
    done: bool,
}

impl<'a, C> Payloads<'a, C>
where
    C: Read + Write,
{
    pub fn link_state(&self) -> LinkState {
        self.framer.state
    }

    fn step(&mut self) -> Result<Option<String>, LinkError<C::Error>> {
        let config = self.framer.config;
        loop {
            self.framer.set_state(LinkState::DataMode);
            self.framer.send(self.reply)?;
            let chunk = self.framer.read_chunk()?;

            match Control::trailing(&chunk) {
                Some(Control::Enq) => {
                    self.reply = Control::Ack;
                    self.count_idle(config.max_idle_reads)?;
                    continue;
                }
                Some(Control::Eot) => {
                    self.framer.set_state(LinkState::PreCommandMode);
                    return Ok(None);
                }
                _ => {}
            }

            let Some(stx) = chunk.iter().position(|b| *b == STX) else {
                // Nothing usable, repeat the last reply
                self.count_idle(config.max_idle_reads)?;
                continue;
            };
            self.idle = 0;

            match self.framer.accept(&chunk[stx..]) {
                Ok(text) => {
                    self.reply = Control::Ack;
                    self.rejects = 0;
                    return Ok(Some(text));
                }
                Err(e) => {
                    warn!("rejecting frame: {}", e);
                    self.reply = Control::Nak;
                    self.rejects += 1;
                    if self.rejects > config.max_rejects {
                        error!("giving up after {} rejected frames", self.rejects);
                        return Err(LinkError::Desync {
                            rejects: self.rejects,
                        });
                    }
                }
            }
        }
    }

    fn count_idle(&mut self, max_idle_reads: u32) -> Result<(), LinkError<C::Error>> {
        self.idle += 1;
        if self.idle > max_idle_reads {
            error!("no frame from meter in {} reads", self.idle);
            return Err(LinkError::Timeout {
                state: LinkState::DataMode,
                attempts: self.idle,
            });
        }
        Ok(())
    }
}

impl<'a, C> Iterator for Payloads<'a, C>
where
    C: Read + Write,
{
    type Item = Result<String, LinkError<C::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(text)) => Some(Ok(text)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<'a, C> FusedIterator for Payloads<'a, C> where C: Read + Write {}
