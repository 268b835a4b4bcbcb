use std::sync::Arc;

use crate::filter::Filter;
use crate::message::Message;
use crate::queue::Queue;

/// A queue on another node. Routing stamps the remote queue id into the
/// message's route-to header; moving the message there is left to a bridge.
#[derive(Debug, Clone)]
pub struct RemoteQueueBinding {
    pub address: String,
    pub name: String,
    pub remote_queue_id: u64,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone)]
pub enum Binding {
    Local { address: String, queue: Arc<Queue> },
    Remote(RemoteQueueBinding),
}

impl Binding {
    pub fn address(&self) -> &str {
        match self {
            Binding::Local { address, .. } => address,
            Binding::Remote(remote) => &remote.address,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Binding::Local { queue, .. } => queue.name(),
            Binding::Remote(remote) => &remote.name,
        }
    }

    pub fn filter(&self) -> Option<&Filter> {
        match self {
            Binding::Local { queue, .. } => queue.filter(),
            Binding::Remote(remote) => remote.filter.as_ref(),
        }
    }

    pub fn queue(&self) -> Option<&Arc<Queue>> {
        match self {
            Binding::Local { queue, .. } => Some(queue),
            Binding::Remote(_) => None,
        }
    }

    pub fn accepts(&self, message: &Message) -> bool {
        self.filter().map_or(true, |f| f.matches(message))
    }
}
