//! Message kind flags.

use bitflags::bitflags;

bitflags! {
    /// Kind byte carried in every frame.
    ///
    /// Only a handful of combinations are legal on the wire: `CALL`,
    /// `RETURN`, `RETURN | EXCEPTION`, `GOODBYE` and `HEARTBEAT`. Anything
    /// else is a protocol violation and fails the connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageKind: u8 {
        /// Method invocation; the frame carries a call header.
        const CALL      = 0b0000_0001;
        /// Response to an earlier call.
        const RETURN    = 0b0000_0010;
        /// Modifier on RETURN: the payload is a fault, not a value.
        const EXCEPTION = 0b0000_0100;
        /// Clean shutdown notification.
        const GOODBYE   = 0b0000_1000;
        /// Liveness probe or probe reply.
        const HEARTBEAT = 0b0001_0000;
    }
}

impl MessageKind {
    /// Whether this is a value a conforming peer may put on the wire.
    pub fn is_valid_wire_kind(self) -> bool {
        self == Self::CALL
            || self == Self::RETURN
            || self == Self::GOODBYE
            || self == Self::HEARTBEAT
            || self == Self::RETURN.union(Self::EXCEPTION)
    }

    /// Whether the frame carries a call header (servant id, interface,
    /// method name) between the kind byte and the payload.
    pub fn has_call_header(self) -> bool {
        self.contains(Self::CALL)
    }

    /// Whether this kind completes a pending call on the receiver.
    pub fn is_response(self) -> bool {
        self.contains(Self::RETURN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_kind_validation() {
        assert!(MessageKind::CALL.is_valid_wire_kind());
        assert!(MessageKind::RETURN.is_valid_wire_kind());
        assert!((MessageKind::RETURN | MessageKind::EXCEPTION).is_valid_wire_kind());
        assert!(MessageKind::GOODBYE.is_valid_wire_kind());
        assert!(MessageKind::HEARTBEAT.is_valid_wire_kind());

        // EXCEPTION never travels alone, and CALL never composes.
        assert!(!MessageKind::EXCEPTION.is_valid_wire_kind());
        assert!(!(MessageKind::CALL | MessageKind::RETURN).is_valid_wire_kind());
        assert!(!(MessageKind::GOODBYE | MessageKind::HEARTBEAT).is_valid_wire_kind());
        assert!(!MessageKind::empty().is_valid_wire_kind());
    }

    #[test]
    fn kind_byte_values_are_wire_stable() {
        assert_eq!(MessageKind::CALL.bits(), 0x01);
        assert_eq!(MessageKind::RETURN.bits(), 0x02);
        assert_eq!(MessageKind::EXCEPTION.bits(), 0x04);
        assert_eq!(MessageKind::GOODBYE.bits(), 0x08);
        assert_eq!(MessageKind::HEARTBEAT.bits(), 0x10);
    }
}
