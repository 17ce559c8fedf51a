/// Single byte handshake codes exchanged between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    /// End of transmission. Also sent by the host to say "nothing to send yet".
    Eot = 0x04,
    /// Enquiry, the sender wants the line.
    Enq = 0x05,
    Ack = 0x06,
    Nak = 0x15,
}

impl Control {
    pub const fn value(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Control> {
        match byte {
            0x04 => Some(Control::Eot),
            0x05 => Some(Control::Enq),
            0x06 => Some(Control::Ack),
            0x15 => Some(Control::Nak),
            _ => None,
        }
    }

    /// The control code a chunk ends with. The meter signals line state
    /// through the last byte of whatever it sent.
    pub fn trailing(chunk: &[u8]) -> Option<Control> {
        chunk.last().copied().and_then(Control::from_byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_looks_only_at_last_byte() {
        assert_eq!(Control::trailing(&[0x04, 0x05]), Some(Control::Enq));
        assert_eq!(Control::trailing(&[0x05, 0x04]), Some(Control::Eot));
        assert_eq!(Control::trailing(b"D|0|\r\n\x06"), Some(Control::Ack));
        assert_eq!(Control::trailing(b"\x021G\r\x179C\r\n"), None);
        assert_eq!(Control::trailing(&[]), None);
    }

    #[test]
    fn values_match_ascii() {
        for c in [Control::Eot, Control::Enq, Control::Ack, Control::Nak] {
            assert_eq!(Control::from_byte(c.value()), Some(c));
        }
        assert_eq!(Control::Nak.value(), 0x15);
    }
}
