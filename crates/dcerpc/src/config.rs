//! Client configuration

use crate::pdu::DEFAULT_MAX_FRAG;
use crate::security::SecurityProvider;
use crate::transport::DEFAULT_MAX_PDU_SIZE;
use msrpc_ndr::NdrContext;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Smallest fragment every implementation must accept
pub const MIN_FRAG_SIZE: u16 = 1432;

/// Settings for an [`RpcClient`](crate::RpcClient)
#[derive(Clone)]
pub struct ClientConfig {
    /// Largest fragment we send; the peer's limit may lower it
    pub max_xmit_frag: u16,
    /// Largest fragment we accept; the peer's limit may lower it
    pub max_recv_frag: u16,
    /// Hard cap on any PDU read from or written to the transport
    pub max_pdu_size: usize,
    /// Deadline for one bind, alter context or call exchange
    pub call_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Association group to join (0 asks the server for a new one)
    pub assoc_group_id: u32,
    /// Decoder limits applied to response stubs
    pub ndr: NdrContext,
    pub security: Option<Arc<dyn SecurityProvider>>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frag(mut self, max_xmit_frag: u16, max_recv_frag: u16) -> Self {
        self.max_xmit_frag = max_xmit_frag.max(MIN_FRAG_SIZE);
        self.max_recv_frag = max_recv_frag.max(MIN_FRAG_SIZE);
        self
    }

    pub fn with_max_pdu_size(mut self, max_pdu_size: usize) -> Self {
        self.max_pdu_size = max_pdu_size;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_assoc_group_id(mut self, assoc_group_id: u32) -> Self {
        self.assoc_group_id = assoc_group_id;
        self
    }

    pub fn with_ndr_context(mut self, ndr: NdrContext) -> Self {
        self.ndr = ndr;
        self
    }

    pub fn with_security(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(provider);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            call_timeout: None,
            connect_timeout: None,
            assoc_group_id: 0,
            ndr: NdrContext::default(),
            security: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_xmit_frag", &self.max_xmit_frag)
            .field("max_recv_frag", &self.max_recv_frag)
            .field("max_pdu_size", &self.max_pdu_size)
            .field("call_timeout", &self.call_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("assoc_group_id", &self.assoc_group_id)
            .field("ndr", &self.ndr)
            .field(
                "security",
                &self
                    .security
                    .as_ref()
                    .map(|s| (s.auth_type(), s.auth_level())),
            )
            .finish()
    }
}
