//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

use std::time::Duration;

/// RTMP version number (always 3 for plain RTMP)
pub const RTMP_VERSION: u8 = 3;

/// Default RTMP port
pub const RTMP_DEFAULT_PORT: u16 = 1935;

/// Vhost token used when the client supplied none
pub const RTMP_DEFAULT_VHOST: &str = "__defaultVhost__";

/// The query parameter form of the default vhost, stripped after discovery
pub const RTMP_DEFAULT_VHOST_PARAM: &str = "?vhost?__defaultVhost__";

/// Handshake payload size (C1/C2/S1/S2)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size both sides start with, until negotiated
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Smallest inbound chunk size the server accepts
pub const MIN_CHUNK_SIZE: u32 = 128;

/// Largest inbound chunk size the server accepts without a warning
pub const MAX_CHUNK_SIZE: u32 = 65536;

/// Chunk size the server pushes to clients after connect
pub const OUT_CHUNK_SIZE: u32 = 60000;

/// Timestamps at or above this value spill into the extended timestamp field
pub const EXTENDED_TIMESTAMP: u32 = 0xFFFFFF;

/// Absolute timestamps are masked to 31 bits on ingress
pub const TIMESTAMP_MASK: i64 = 0x7FFF_FFFF;

/// Chunk streams with cid below this live in a fixed-size cache
pub const CHUNK_STREAM_CACHE: usize = 64;

/// Default receive buffer capacity (128 KiB)
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 128 * 1024;

/// Hard cap on the receive buffer capacity (256 KiB)
pub const MAX_RECV_BUFFER_SIZE: usize = 256 * 1024;

// ============================================================================
// Chunk stream IDs (cid)
// ============================================================================

/// Protocol control messages (set chunk size, acks, user control)
pub const CID_PROTOCOL_CONTROL: u32 = 2;

/// Connection-level AMF0 commands (connect, createStream, ...)
pub const CID_OVER_CONNECTION: u32 = 3;

/// Stream-level data messages (onMetaData)
pub const CID_OVER_CONNECTION2: u32 = 4;

/// Stream-level commands (publish, play, onStatus)
pub const CID_OVER_STREAM: u32 = 5;

/// Video data
pub const CID_VIDEO: u32 = 6;

/// Audio data
pub const CID_AUDIO: u32 = 7;

// ============================================================================
// Message type IDs
// ============================================================================

/// Set Chunk Size (1)
pub const MSG_SET_CHUNK_SIZE: u8 = 1;

/// Abort Message (2)
pub const MSG_ABORT: u8 = 2;

/// Acknowledgement (3)
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;

/// User Control Message (4)
pub const MSG_USER_CONTROL: u8 = 4;

/// Window Acknowledgement Size (5)
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;

/// Set Peer Bandwidth (6)
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;

/// Audio Message (8)
pub const MSG_AUDIO: u8 = 8;

/// Video Message (9)
pub const MSG_VIDEO: u8 = 9;

/// AMF3 Data Message (15)
pub const MSG_DATA_AMF3: u8 = 15;

/// AMF3 Command Message (17)
pub const MSG_COMMAND_AMF3: u8 = 17;

/// AMF0 Data Message (18) - @setDataFrame, onMetaData
pub const MSG_DATA_AMF0: u8 = 18;

/// AMF0 Command Message (20) - connect, play, publish, ...
pub const MSG_COMMAND_AMF0: u8 = 20;

/// Aggregate Message (22)
pub const MSG_AGGREGATE: u8 = 22;

// ============================================================================
// User control event types
// ============================================================================

pub const UC_STREAM_BEGIN: u16 = 0;
pub const UC_STREAM_EOF: u16 = 1;
pub const UC_STREAM_DRY: u16 = 2;
pub const UC_SET_BUFFER_LENGTH: u16 = 3;
pub const UC_STREAM_IS_RECORDED: u16 = 4;
pub const UC_PING_REQUEST: u16 = 6;
pub const UC_PING_RESPONSE: u16 = 7;

// ============================================================================
// Peer bandwidth limit types
// ============================================================================

pub const BANDWIDTH_LIMIT_HARD: u8 = 0;
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// ============================================================================
// Command names
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_PLAY: &str = "play";
pub const CMD_PAUSE: &str = "pause";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_UNPUBLISH: &str = "FCUnpublish";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";
pub const CMD_ON_FC_PUBLISH: &str = "onFCPublish";
pub const CMD_ON_FC_UNPUBLISH: &str = "onFCUnpublish";
pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";
pub const CMD_ON_METADATA: &str = "onMetaData";

// ============================================================================
// Status codes
// ============================================================================

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PUBLISH_BAD_NAME: &str = "NetStream.Publish.BadName";
pub const NS_UNPUBLISH_SUCCESS: &str = "NetStream.Unpublish.Success";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NS_PAUSE_NOTIFY: &str = "NetStream.Pause.Notify";
pub const NS_UNPAUSE_NOTIFY: &str = "NetStream.Unpause.Notify";

pub const STATUS_LEVEL_STATUS: &str = "status";
pub const STATUS_LEVEL_ERROR: &str = "error";

// ============================================================================
// Server identity and defaults
// ============================================================================

/// fmsVer advertised in the connect _result
pub const FMS_VERSION: &str = "FMS/3,5,3,888";

/// capabilities advertised in the connect _result
pub const FMS_CAPABILITIES: f64 = 127.0;

/// Window acknowledgement size pushed after connect (2.5 MB)
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Peer bandwidth pushed after connect (2.5 MB)
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

// ============================================================================
// Chunk header format types (fmt field)
// ============================================================================

/// Type 0: full header (11 bytes)
pub const FMT_TYPE0: u8 = 0;

/// Type 1: no stream id (7 bytes)
pub const FMT_TYPE1: u8 = 1;

/// Type 2: timestamp delta only (3 bytes)
pub const FMT_TYPE2: u8 = 2;

/// Type 3: no header (0 bytes)
pub const FMT_TYPE3: u8 = 3;

// ============================================================================
// Timeouts and merged-write tuning
// ============================================================================

/// Per-operation socket receive deadline
pub const RTMP_RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-operation socket send deadline
pub const RTMP_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the handshake + connect phases
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages pulled per merged-write batch
pub const MW_MSGS: usize = 128;

/// A parked play loop is woken once this many messages are queued
pub const MW_MIN_MSGS: usize = 8;

/// Bounded FIFO depth of the playing-side receive task
pub const QUEUE_RECV_CAPACITY: usize = 8;

/// Publisher gone + consumers gone + this long idle => source reaped
pub const SOURCE_DIE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between registry reaper passes
pub const SOURCE_CYCLE_INTERVAL: Duration = Duration::from_secs(1);
