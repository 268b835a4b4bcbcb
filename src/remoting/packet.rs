#![allow(clippy::upper_case_acronyms)]

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer;
use crate::message::Message;
use crate::transaction::Xid;
use crate::{Error, Result};

/// Bumped whenever a packet body changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Ping = 4,
    Pong = 5,
    Exception = 10,
    Close = 11,
    NullResponse = 12,
    PacketsConfirmed = 13,
    CreateConnection = 20,
    CreateConnectionResp = 21,
    ConnCreateSession = 30,
    ConnCreateSessionResp = 31,
    ConnStart = 32,
    ConnStop = 33,
    SessCreateConsumer = 41,
    SessCreateConsumerResp = 42,
    SessSend = 45,
    SessDeliver = 46,
    SessAcknowledge = 47,
    SessCommit = 49,
    SessRollback = 50,
    SessCancel = 51,
    SessQueueQuery = 52,
    SessQueueQueryResp = 53,
    SessCreateQueue = 54,
    SessDeleteQueue = 55,
    SessCreateBrowser = 56,
    SessCreateBrowserResp = 57,
    SessBrowserNext = 58,
    SessBrowserNextResp = 59,
    SessBrowserReset = 60,
    SessBrowserClose = 61,
    SessXaStart = 67,
    SessXaEnd = 68,
    SessXaCommit = 69,
    SessXaPrepare = 70,
    SessXaResp = 71,
    SessXaRollback = 72,
    SessXaJoin = 73,
    SessXaSuspend = 74,
    SessXaResume = 75,
    SessXaForget = 76,
    SessXaInDoubtXids = 77,
    SessXaInDoubtXidsResp = 78,
    SessXaSetTimeout = 79,
    SessXaSetTimeoutResp = 80,
    SessXaGetTimeout = 81,
    SessXaGetTimeoutResp = 82,
    ConsClose = 91,
    ConsCredits = 92,
}

impl PacketType {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        use PacketType::*;
        Some(match value {
            4 => Ping,
            5 => Pong,
            10 => Exception,
            11 => Close,
            12 => NullResponse,
            13 => PacketsConfirmed,
            20 => CreateConnection,
            21 => CreateConnectionResp,
            30 => ConnCreateSession,
            31 => ConnCreateSessionResp,
            32 => ConnStart,
            33 => ConnStop,
            41 => SessCreateConsumer,
            42 => SessCreateConsumerResp,
            45 => SessSend,
            46 => SessDeliver,
            47 => SessAcknowledge,
            49 => SessCommit,
            50 => SessRollback,
            51 => SessCancel,
            52 => SessQueueQuery,
            53 => SessQueueQueryResp,
            54 => SessCreateQueue,
            55 => SessDeleteQueue,
            56 => SessCreateBrowser,
            57 => SessCreateBrowserResp,
            58 => SessBrowserNext,
            59 => SessBrowserNextResp,
            60 => SessBrowserReset,
            61 => SessBrowserClose,
            67 => SessXaStart,
            68 => SessXaEnd,
            69 => SessXaCommit,
            70 => SessXaPrepare,
            71 => SessXaResp,
            72 => SessXaRollback,
            73 => SessXaJoin,
            74 => SessXaSuspend,
            75 => SessXaResume,
            76 => SessXaForget,
            77 => SessXaInDoubtXids,
            78 => SessXaInDoubtXidsResp,
            79 => SessXaSetTimeout,
            80 => SessXaSetTimeoutResp,
            81 => SessXaGetTimeout,
            82 => SessXaGetTimeoutResp,
            91 => ConsClose,
            92 => ConsCredits,
            _ => return None,
        })
    }
}

/// Answer to a queue query. `exists == false` leaves the other fields at
/// their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueQueryResult {
    pub exists: bool,
    pub durable: bool,
    pub temporary: bool,
    pub filter: Option<String>,
    pub address: Option<String>,
    pub message_count: u64,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Ping,
    Pong,
    Exception { code: i32, message: String },
    Close,
    NullResponse,
    PacketsConfirmed { command_id: i64 },
    CreateConnection {
        version: u32,
        username: Option<String>,
        password: Option<String>,
    },
    CreateConnectionResp { connection_id: u64 },
    CreateSession {
        xa: bool,
        auto_commit_sends: bool,
        auto_commit_acks: bool,
    },
    CreateSessionResp { session_id: u64 },
    ConnStart,
    ConnStop,
    /// `window_size` is the number of unacknowledged deliveries the broker
    /// may push ahead of the client; negative disables flow control.
    CreateConsumer {
        queue_name: String,
        filter: Option<String>,
        window_size: i32,
    },
    CreateConsumerResp { consumer_id: u64 },
    Send { message: Message },
    Deliver {
        consumer_id: u64,
        delivery_count: u32,
        message: Message,
    },
    Acknowledge { consumer_id: u64, message_id: u64 },
    Commit,
    Rollback,
    Cancel { consumer_id: u64, message_id: u64 },
    QueueQuery { queue_name: String },
    QueueQueryResp(QueueQueryResult),
    CreateQueue {
        address: String,
        queue_name: String,
        filter: Option<String>,
        durable: bool,
        temporary: bool,
    },
    DeleteQueue { queue_name: String },
    CreateBrowser {
        queue_name: String,
        filter: Option<String>,
    },
    CreateBrowserResp { browser_id: u64 },
    BrowserNext { browser_id: u64 },
    /// `None` once the browser has seen everything.
    BrowserNextResp { message: Option<Message> },
    BrowserReset { browser_id: u64 },
    BrowserClose { browser_id: u64 },
    XaStart { xid: Xid },
    XaEnd { xid: Xid, failed: bool },
    XaCommit { xid: Xid, one_phase: bool },
    XaPrepare { xid: Xid },
    XaResp {
        error: bool,
        code: i32,
        message: Option<String>,
    },
    XaRollback { xid: Xid },
    XaJoin { xid: Xid },
    XaSuspend,
    XaResume { xid: Xid },
    XaForget { xid: Xid },
    XaInDoubtXids,
    XaInDoubtXidsResp { xids: Vec<Xid> },
    XaSetTimeout { seconds: u32 },
    XaSetTimeoutResp { ok: bool },
    XaGetTimeout,
    XaGetTimeoutResp { seconds: u32 },
    ConsumerClose { consumer_id: u64 },
    /// Lets the broker send `credits` more messages to a consumer.
    ConsumerCredits { consumer_id: u64, credits: u32 },
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        use PacketBody as B;
        use PacketType as T;
        match self {
            B::Ping => T::Ping,
            B::Pong => T::Pong,
            B::Exception { .. } => T::Exception,
            B::Close => T::Close,
            B::NullResponse => T::NullResponse,
            B::PacketsConfirmed { .. } => T::PacketsConfirmed,
            B::CreateConnection { .. } => T::CreateConnection,
            B::CreateConnectionResp { .. } => T::CreateConnectionResp,
            B::CreateSession { .. } => T::ConnCreateSession,
            B::CreateSessionResp { .. } => T::ConnCreateSessionResp,
            B::ConnStart => T::ConnStart,
            B::ConnStop => T::ConnStop,
            B::CreateConsumer { .. } => T::SessCreateConsumer,
            B::CreateConsumerResp { .. } => T::SessCreateConsumerResp,
            B::Send { .. } => T::SessSend,
            B::Deliver { .. } => T::SessDeliver,
            B::Acknowledge { .. } => T::SessAcknowledge,
            B::Commit => T::SessCommit,
            B::Rollback => T::SessRollback,
            B::Cancel { .. } => T::SessCancel,
            B::QueueQuery { .. } => T::SessQueueQuery,
            B::QueueQueryResp(_) => T::SessQueueQueryResp,
            B::CreateQueue { .. } => T::SessCreateQueue,
            B::DeleteQueue { .. } => T::SessDeleteQueue,
            B::CreateBrowser { .. } => T::SessCreateBrowser,
            B::CreateBrowserResp { .. } => T::SessCreateBrowserResp,
            B::BrowserNext { .. } => T::SessBrowserNext,
            B::BrowserNextResp { .. } => T::SessBrowserNextResp,
            B::BrowserReset { .. } => T::SessBrowserReset,
            B::BrowserClose { .. } => T::SessBrowserClose,
            B::XaStart { .. } => T::SessXaStart,
            B::XaEnd { .. } => T::SessXaEnd,
            B::XaCommit { .. } => T::SessXaCommit,
            B::XaPrepare { .. } => T::SessXaPrepare,
            B::XaResp { .. } => T::SessXaResp,
            B::XaRollback { .. } => T::SessXaRollback,
            B::XaJoin { .. } => T::SessXaJoin,
            B::XaSuspend => T::SessXaSuspend,
            B::XaResume { .. } => T::SessXaResume,
            B::XaForget { .. } => T::SessXaForget,
            B::XaInDoubtXids => T::SessXaInDoubtXids,
            B::XaInDoubtXidsResp { .. } => T::SessXaInDoubtXidsResp,
            B::XaSetTimeout { .. } => T::SessXaSetTimeout,
            B::XaSetTimeoutResp { .. } => T::SessXaSetTimeoutResp,
            B::XaGetTimeout => T::SessXaGetTimeout,
            B::XaGetTimeoutResp { .. } => T::SessXaGetTimeoutResp,
            B::ConsumerClose { .. } => T::ConsClose,
            B::ConsumerCredits { .. } => T::ConsCredits,
        }
    }

    /// Whether this body answers a blocking request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            PacketBody::Pong
                | PacketBody::Exception { .. }
                | PacketBody::NullResponse
                | PacketBody::CreateConnectionResp { .. }
                | PacketBody::CreateSessionResp { .. }
                | PacketBody::CreateConsumerResp { .. }
                | PacketBody::CreateBrowserResp { .. }
                | PacketBody::BrowserNextResp { .. }
                | PacketBody::QueueQueryResp(_)
                | PacketBody::XaResp { .. }
                | PacketBody::XaInDoubtXidsResp { .. }
                | PacketBody::XaSetTimeoutResp { .. }
                | PacketBody::XaGetTimeoutResp { .. }
        )
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        use PacketBody as B;
        match self {
            B::Ping
            | B::Pong
            | B::Close
            | B::NullResponse
            | B::ConnStart
            | B::ConnStop
            | B::Commit
            | B::Rollback
            | B::XaSuspend
            | B::XaInDoubtXids
            | B::XaGetTimeout => {}
            B::Exception { code, message } => {
                buf.put_i32(*code);
                buffer::put_string(buf, message);
            }
            B::PacketsConfirmed { command_id } => buf.put_i64(*command_id),
            B::CreateConnection {
                version,
                username,
                password,
            } => {
                buf.put_u32(*version);
                buffer::put_nullable_string(buf, username.as_deref());
                buffer::put_nullable_string(buf, password.as_deref());
            }
            B::CreateConnectionResp { connection_id } => buf.put_u64(*connection_id),
            B::CreateSession {
                xa,
                auto_commit_sends,
                auto_commit_acks,
            } => {
                buf.put_u8(*xa as u8);
                buf.put_u8(*auto_commit_sends as u8);
                buf.put_u8(*auto_commit_acks as u8);
            }
            B::CreateSessionResp { session_id } => buf.put_u64(*session_id),
            B::CreateConsumer {
                queue_name,
                filter,
                window_size,
            } => {
                buffer::put_string(buf, queue_name);
                buffer::put_nullable_string(buf, filter.as_deref());
                buf.put_i32(*window_size);
            }
            B::CreateBrowser { queue_name, filter } => {
                buffer::put_string(buf, queue_name);
                buffer::put_nullable_string(buf, filter.as_deref());
            }
            B::CreateBrowserResp { browser_id }
            | B::BrowserNext { browser_id }
            | B::BrowserReset { browser_id }
            | B::BrowserClose { browser_id } => buf.put_u64(*browser_id),
            B::BrowserNextResp { message } => match message {
                Some(message) => {
                    buf.put_u8(1);
                    message.encode(buf);
                }
                None => buf.put_u8(0),
            },
            B::CreateConsumerResp { consumer_id } => buf.put_u64(*consumer_id),
            B::Send { message } => message.encode(buf),
            B::Deliver {
                consumer_id,
                delivery_count,
                message,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_u32(*delivery_count);
                message.encode(buf);
            }
            B::Acknowledge {
                consumer_id,
                message_id,
            }
            | B::Cancel {
                consumer_id,
                message_id,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_u64(*message_id);
            }
            B::QueueQuery { queue_name } | B::DeleteQueue { queue_name } => {
                buffer::put_string(buf, queue_name)
            }
            B::QueueQueryResp(result) => {
                buf.put_u8(result.exists as u8);
                buf.put_u8(result.durable as u8);
                buf.put_u8(result.temporary as u8);
                buffer::put_nullable_string(buf, result.filter.as_deref());
                buffer::put_nullable_string(buf, result.address.as_deref());
                buf.put_u64(result.message_count);
                buf.put_u32(result.consumer_count);
            }
            B::CreateQueue {
                address,
                queue_name,
                filter,
                durable,
                temporary,
            } => {
                buffer::put_string(buf, address);
                buffer::put_string(buf, queue_name);
                buffer::put_nullable_string(buf, filter.as_deref());
                buf.put_u8(*durable as u8);
                buf.put_u8(*temporary as u8);
            }
            B::XaStart { xid }
            | B::XaPrepare { xid }
            | B::XaRollback { xid }
            | B::XaJoin { xid }
            | B::XaResume { xid }
            | B::XaForget { xid } => xid.encode(buf),
            B::XaEnd { xid, failed } => {
                xid.encode(buf);
                buf.put_u8(*failed as u8);
            }
            B::XaCommit { xid, one_phase } => {
                xid.encode(buf);
                buf.put_u8(*one_phase as u8);
            }
            B::XaResp {
                error,
                code,
                message,
            } => {
                buf.put_u8(*error as u8);
                buf.put_i32(*code);
                buffer::put_nullable_string(buf, message.as_deref());
            }
            B::XaInDoubtXidsResp { xids } => {
                buf.put_i32(xids.len() as i32);
                for xid in xids {
                    xid.encode(buf);
                }
            }
            B::XaSetTimeout { seconds } | B::XaGetTimeoutResp { seconds } => buf.put_u32(*seconds),
            B::XaSetTimeoutResp { ok } => buf.put_u8(*ok as u8),
            B::ConsumerClose { consumer_id } => buf.put_u64(*consumer_id),
            B::ConsumerCredits { consumer_id, credits } => {
                buf.put_u64(*consumer_id);
                buf.put_u32(*credits);
            }
        }
    }

    pub(crate) fn decode(packet_type: PacketType, buf: &mut impl Buf) -> Result<Self> {
        use PacketBody as B;
        use PacketType as T;
        Ok(match packet_type {
            T::Ping => B::Ping,
            T::Pong => B::Pong,
            T::Exception => B::Exception {
                code: buffer::get_i32(buf)?,
                message: buffer::get_string(buf)?,
            },
            T::Close => B::Close,
            T::NullResponse => B::NullResponse,
            T::PacketsConfirmed => B::PacketsConfirmed {
                command_id: buffer::get_i64(buf)?,
            },
            T::CreateConnection => B::CreateConnection {
                version: buffer::get_u32(buf)?,
                username: buffer::get_nullable_string(buf)?,
                password: buffer::get_nullable_string(buf)?,
            },
            T::CreateConnectionResp => B::CreateConnectionResp {
                connection_id: buffer::get_u64(buf)?,
            },
            T::ConnCreateSession => B::CreateSession {
                xa: buffer::get_bool(buf)?,
                auto_commit_sends: buffer::get_bool(buf)?,
                auto_commit_acks: buffer::get_bool(buf)?,
            },
            T::ConnCreateSessionResp => B::CreateSessionResp {
                session_id: buffer::get_u64(buf)?,
            },
            T::ConnStart => B::ConnStart,
            T::ConnStop => B::ConnStop,
            T::SessCreateConsumer => B::CreateConsumer {
                queue_name: buffer::get_string(buf)?,
                filter: buffer::get_nullable_string(buf)?,
                window_size: buffer::get_i32(buf)?,
            },
            T::SessCreateConsumerResp => B::CreateConsumerResp {
                consumer_id: buffer::get_u64(buf)?,
            },
            T::SessSend => B::Send {
                message: Message::decode(buf)?,
            },
            T::SessDeliver => B::Deliver {
                consumer_id: buffer::get_u64(buf)?,
                delivery_count: buffer::get_u32(buf)?,
                message: Message::decode(buf)?,
            },
            T::SessAcknowledge => B::Acknowledge {
                consumer_id: buffer::get_u64(buf)?,
                message_id: buffer::get_u64(buf)?,
            },
            T::SessCommit => B::Commit,
            T::SessRollback => B::Rollback,
            T::SessCancel => B::Cancel {
                consumer_id: buffer::get_u64(buf)?,
                message_id: buffer::get_u64(buf)?,
            },
            T::SessQueueQuery => B::QueueQuery {
                queue_name: buffer::get_string(buf)?,
            },
            T::SessQueueQueryResp => B::QueueQueryResp(QueueQueryResult {
                exists: buffer::get_bool(buf)?,
                durable: buffer::get_bool(buf)?,
                temporary: buffer::get_bool(buf)?,
                filter: buffer::get_nullable_string(buf)?,
                address: buffer::get_nullable_string(buf)?,
                message_count: buffer::get_u64(buf)?,
                consumer_count: buffer::get_u32(buf)?,
            }),
            T::SessCreateQueue => B::CreateQueue {
                address: buffer::get_string(buf)?,
                queue_name: buffer::get_string(buf)?,
                filter: buffer::get_nullable_string(buf)?,
                durable: buffer::get_bool(buf)?,
                temporary: buffer::get_bool(buf)?,
            },
            T::SessDeleteQueue => B::DeleteQueue {
                queue_name: buffer::get_string(buf)?,
            },
            T::SessCreateBrowser => B::CreateBrowser {
                queue_name: buffer::get_string(buf)?,
                filter: buffer::get_nullable_string(buf)?,
            },
            T::SessCreateBrowserResp => B::CreateBrowserResp {
                browser_id: buffer::get_u64(buf)?,
            },
            T::SessBrowserNext => B::BrowserNext {
                browser_id: buffer::get_u64(buf)?,
            },
            T::SessBrowserNextResp => B::BrowserNextResp {
                message: if buffer::get_bool(buf)? {
                    Some(Message::decode(buf)?)
                } else {
                    None
                },
            },
            T::SessBrowserReset => B::BrowserReset {
                browser_id: buffer::get_u64(buf)?,
            },
            T::SessBrowserClose => B::BrowserClose {
                browser_id: buffer::get_u64(buf)?,
            },
            T::SessXaStart => B::XaStart { xid: Xid::decode(buf)? },
            T::SessXaEnd => B::XaEnd {
                xid: Xid::decode(buf)?,
                failed: buffer::get_bool(buf)?,
            },
            T::SessXaCommit => B::XaCommit {
                xid: Xid::decode(buf)?,
                one_phase: buffer::get_bool(buf)?,
            },
            T::SessXaPrepare => B::XaPrepare { xid: Xid::decode(buf)? },
            T::SessXaResp => B::XaResp {
                error: buffer::get_bool(buf)?,
                code: buffer::get_i32(buf)?,
                message: buffer::get_nullable_string(buf)?,
            },
            T::SessXaRollback => B::XaRollback { xid: Xid::decode(buf)? },
            T::SessXaJoin => B::XaJoin { xid: Xid::decode(buf)? },
            T::SessXaSuspend => B::XaSuspend,
            T::SessXaResume => B::XaResume { xid: Xid::decode(buf)? },
            T::SessXaForget => B::XaForget { xid: Xid::decode(buf)? },
            T::SessXaInDoubtXids => B::XaInDoubtXids,
            T::SessXaInDoubtXidsResp => {
                let count = buffer::get_i32(buf)?;
                if count < 0 {
                    return Err(Error::Corrupt("negative xid count"));
                }
                let xids = (0..count)
                    .map(|_| Xid::decode(buf))
                    .collect::<Result<Vec<_>>>()?;
                B::XaInDoubtXidsResp { xids }
            }
            T::SessXaSetTimeout => B::XaSetTimeout {
                seconds: buffer::get_u32(buf)?,
            },
            T::SessXaSetTimeoutResp => B::XaSetTimeoutResp {
                ok: buffer::get_bool(buf)?,
            },
            T::SessXaGetTimeout => B::XaGetTimeout,
            T::SessXaGetTimeoutResp => B::XaGetTimeoutResp {
                seconds: buffer::get_u32(buf)?,
            },
            T::ConsClose => B::ConsumerClose {
                consumer_id: buffer::get_u64(buf)?,
            },
            T::ConsCredits => B::ConsumerCredits {
                consumer_id: buffer::get_u64(buf)?,
                credits: buffer::get_u32(buf)?,
            },
        })
    }
}

/// One unit on the wire. `correlation_id` doubles as the sender's command
/// id; a response carries the id of the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub correlation_id: i64,
    pub target_id: Option<String>,
    pub callback_id: Option<String>,
    pub one_way: bool,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(body: PacketBody) -> Self {
        Self {
            correlation_id: 0,
            target_id: None,
            callback_id: None,
            one_way: false,
            body,
        }
    }

    /// A packet addressed to a session or other target on the peer.
    pub fn to_target(target: impl ToString, body: PacketBody) -> Self {
        Self {
            target_id: Some(target.to_string()),
            ..Self::new(body)
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    /// The target id parsed as a numeric object id.
    pub fn target(&self) -> Option<u64> {
        self.target_id.as_deref().and_then(|t| t.parse().ok())
    }

    pub fn exception(error: &Error) -> PacketBody {
        PacketBody::Exception {
            code: error.code().as_i32(),
            message: error.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        super::codec::Codec::encode(self, &mut buf);
        buf.freeze()
    }
}
