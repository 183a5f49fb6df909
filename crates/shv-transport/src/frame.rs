use bytes::Bytes;

/// One frame received from or sent to a [`Link`](crate::Link).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A message payload: protocol indicator byte followed by codec bytes.
    Message(Bytes),
    /// The in-band reset control, a single `0x00` payload on the wire.
    Reset,
}

impl Frame {
    /// The wire payload of this frame.
    pub fn payload(&self) -> Bytes {
        match self {
            Frame::Message(data) => data.clone(),
            Frame::Reset => Bytes::from_static(&[0]),
        }
    }

    /// Classify a received payload.
    pub fn from_payload(data: Bytes) -> Self {
        if data.as_ref() == [0] {
            Frame::Reset
        } else {
            Frame::Message(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_single_zero_byte() {
        assert_eq!(Frame::Reset.payload().as_ref(), [0]);
        assert_eq!(Frame::from_payload(Bytes::from_static(&[0])), Frame::Reset);
    }

    #[test]
    fn messages_pass_through() {
        let data = Bytes::from_static(&[1, 0x88, 0xff]);
        assert_eq!(
            Frame::from_payload(data.clone()),
            Frame::Message(data.clone())
        );
        assert_eq!(Frame::Message(data.clone()).payload(), data);
    }
}
