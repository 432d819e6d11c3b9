//! Wire protocol commands (§6.2).
//!
//! A tag-struct packet starts with two big-endian `u32`s, `(command, tag)`;
//! the remaining body is command-specific and decoded with [`crate::tagstruct`].

/// Numeric command ids. Only the subset the core itself sends or routes is
/// enumerated; an unrecognized id on the wire is a protocol violation
/// (§4.5 "Unknown command").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    // Replies, routed by tag rather than by command (§4.5).
    Reply = 2,
    Error = 0,
    Timeout = 1,

    // Outbound, client -> daemon.
    Auth = 8,
    SetClientName = 9,
    UpdateClientProplist = 10,
    RemoveClientProplist = 11,
    SetDefaultSink = 12,
    SetDefaultSource = 13,
    Exit = 14,

    // Inbound, routed by command (§6.2).
    Request = 20,
    Overflow = 21,
    Underflow = 22,
    PlaybackStreamKilled = 23,
    RecordStreamKilled = 24,
    PlaybackStreamMoved = 25,
    RecordStreamMoved = 26,
    PlaybackStreamSuspended = 27,
    RecordStreamSuspended = 28,
    Started = 29,
    SubscribeEvent = 30,
    Extension = 31,
    PlaybackStreamEvent = 32,
    RecordStreamEvent = 33,
    ClientEvent = 34,
    PlaybackBufferAttrChanged = 35,
    RecordBufferAttrChanged = 36,
}

impl Command {
    /// Decode a numeric command id from the wire, if recognized.
    pub fn from_wire(id: u32) -> Option<Command> {
        use Command::*;
        let all = [
            Reply, Error, Timeout, Auth, SetClientName, UpdateClientProplist,
            RemoveClientProplist, SetDefaultSink, SetDefaultSource, Exit, Request, Overflow,
            Underflow, PlaybackStreamKilled, RecordStreamKilled, PlaybackStreamMoved,
            RecordStreamMoved, PlaybackStreamSuspended, RecordStreamSuspended, Started,
            SubscribeEvent, Extension, PlaybackStreamEvent, RecordStreamEvent, ClientEvent,
            PlaybackBufferAttrChanged, RecordBufferAttrChanged,
        ];
        all.into_iter().find(|c| *c as u32 == id)
    }

    /// True if this command is a reply dispatched by tag rather than by
    /// command id (§4.5).
    pub fn is_reply_kind(self) -> bool {
        matches!(self, Command::Reply | Command::Error | Command::Timeout)
    }
}

/// A decoded packet header, as carried by every tag-struct packet.
#[derive(Debug, Copy, Clone)]
pub struct PacketHeader {
    pub command: u32,
    pub tag: u32,
}

/// The two well-known extension names routed by the `EXTENSION` handler
/// (§6.2); anything else is logged and discarded.
pub const EXT_STREAM_RESTORE: &str = "module-stream-restore";
pub const EXT_DEVICE_MANAGER: &str = "module-device-manager";
