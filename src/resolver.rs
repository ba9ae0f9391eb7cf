use async_trait::async_trait;

use crate::dns::{DnsQuestion, DnsRecord, Packet};

/// Which upstream reply section an answer item was observed in. `None`
/// marks locally synthesized items.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SectionHint {
    Answer,
    Authority,
    Additional,
    #[default]
    None,
}

/// Validation outcome attached to a completed resolver transaction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DnssecResult {
    Secure,
    Insecure,
    Bogus,
    #[default]
    NotValidated,
}

/// Terminal state of a resolver transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResolverState {
    Success,
    RcodeFailure,
    NotFound,
    Timeout,
    AttemptsMax,
    NoServers,
    InvalidReply,
    Errno,
    Aborted,
    DnssecFailed,
    NoTrustAnchor,
    RrTypeUnsupported,
    NetworkDown,
    NoSource,
    StubLoop,
}

/// One resource record as delivered by the resolver, with its placement
/// hint and optional signature sidecar.
#[derive(Clone, Debug)]
pub struct AnswerItem {
    pub record: DnsRecord,
    pub ifindex: Option<u32>,
    pub hint: SectionHint,
    pub authenticated: bool,
    pub rrsig: Option<DnsRecord>,
}

impl AnswerItem {
    pub fn new(record: DnsRecord) -> Self {
        Self {
            record,
            ifindex: None,
            hint: SectionHint::None,
            authenticated: false,
            rrsig: None,
        }
    }

    pub fn with_hint(mut self, hint: SectionHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn with_rrsig(mut self, rrsig: DnsRecord) -> Self {
        self.rrsig = Some(rrsig);
        self
    }

    pub fn authenticated(mut self, value: bool) -> Self {
        self.authenticated = value;
        self
    }
}

/// Completion payload of a resolver transaction.
#[derive(Clone, Debug)]
pub struct ResolverAnswer {
    pub state: ResolverState,
    pub rcode: u16,
    pub dnssec: DnssecResult,
    pub items: Vec<AnswerItem>,
    /// Full upstream reply packet, present only for bypass queries.
    pub upstream: Option<Packet>,
    pub fully_authenticated: bool,
    pub fully_synthetic: bool,
}

impl ResolverAnswer {
    pub fn failure(state: ResolverState) -> Self {
        Self {
            state,
            rcode: 0,
            dnssec: DnssecResult::NotValidated,
            items: Vec::new(),
            upstream: None,
            fully_authenticated: false,
            fully_synthetic: false,
        }
    }
}

/// Transaction flags handed to the resolver alongside the query. A plain
/// struct of booleans; never an untyped bitmask at this seam.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryFlags {
    pub all_protocols: bool,
    pub no_cname: bool,
    pub no_search: bool,
    pub no_validate: bool,
    pub require_primary: bool,
    pub clamp_ttl: bool,
}

impl QueryFlags {
    /// Flags for a normal stub transaction. `require_primary` follows
    /// the client's DO bit.
    pub fn stub(dnssec_ok: bool) -> Self {
        Self {
            all_protocols: true,
            no_search: true,
            clamp_ttl: true,
            require_primary: dnssec_ok,
            ..Self::default()
        }
    }

    /// Flags for a bypass transaction: the upstream packet is passed
    /// through, so no alias chasing and no local validation.
    pub fn bypass() -> Self {
        Self {
            all_protocols: true,
            no_cname: true,
            no_search: true,
            no_validate: true,
            require_primary: true,
            clamp_ttl: true,
        }
    }
}

/// What the stub submits: the parsed question, or the raw client packet
/// in bypass mode.
#[derive(Clone, Debug)]
pub enum ResolverQuery {
    Question(DnsQuestion),
    RawPacket(Vec<u8>),
}

/// Seam to the recursive/validating resolver. The stub runs each
/// `submit` inside its own task; aborting that task is the idempotent
/// cancellation path and suppresses the completion handling.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn submit(&self, query: ResolverQuery, flags: QueryFlags) -> ResolverAnswer;

    /// True iff the datagram is a looped-back copy of one of our own
    /// upstream queries.
    fn packet_is_our_own(&self, packet: &Packet) -> bool;
}
