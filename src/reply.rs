use tracing::debug;

use crate::assemble::{ReplySections, assemble};
use crate::constants::TCP_SIZE_MAX;
use crate::dns::{DnsQuestion, Packet, Rcode, Section, Transport, opt_record_len};
use crate::error::Result;
use crate::listener::ListenerScope;
use crate::resolver::{DnssecResult, ResolverAnswer, ResolverState};

/// Header booleans derived from the request and the resolver outcome.
#[derive(Copy, Clone, Debug)]
struct DerivedFlags {
    edns0_do: bool,
    aa: bool,
    ad: bool,
    cd: bool,
}

fn derive_flags(request: &Packet, answer: &ResolverAnswer) -> DerivedFlags {
    let edns0_do = request.do_bit()
        && (matches!(answer.dnssec, DnssecResult::Secure | DnssecResult::Insecure)
            || answer.fully_authenticated
            || request.cd());
    DerivedFlags {
        edns0_do,
        aa: answer.fully_synthetic,
        ad: request.ad() && answer.fully_authenticated,
        cd: request.cd() && edns0_do,
    }
}

/// Finalize the reply for a completed resolver transaction. Returns
/// `None` for terminal states that intentionally produce no reply (the
/// client is left to time out as well).
pub fn finalize(
    request: &Packet,
    scope: ListenerScope,
    answer: &ResolverAnswer,
    server_nsid: Option<&[u8]>,
) -> Result<Option<Packet>> {
    use ResolverState::*;

    let rcode = match answer.state {
        Success | RcodeFailure => answer.rcode,
        NotFound => Rcode::NXDOMAIN,
        Timeout | AttemptsMax => return Ok(None),
        NoServers | InvalidReply | Errno | Aborted | DnssecFailed | NoTrustAnchor
        | RrTypeUnsupported | NetworkDown | NoSource | StubLoop => Rcode::SERVFAIL,
    };

    // Bypass completion: hand back the upstream packet nearly verbatim.
    if request.do_bit() && request.cd() && matches!(answer.state, Success | RcodeFailure) {
        if let Some(upstream) = &answer.upstream {
            return finish_bypass(request, scope, upstream).map(Some);
        }
    }

    let flags = derive_flags(request, answer);
    let fallback_question =
        DnsQuestion::new("", crate::dns::RecordType::ANY, crate::dns::RecordClass::ANY);
    let sections = match answer.state {
        Success | RcodeFailure | NotFound => {
            let question = request.question().unwrap_or(&fallback_question);
            let assembly = assemble(question, &answer.items, flags.edns0_do);
            if assembly.redirect_loop {
                debug!(
                    id = request.id(),
                    transport = request.transport.as_str(),
                    "alias chain exceeded redirection bound, replying with partial chain"
                );
            }
            assembly.sections
        }
        _ => ReplySections::default(),
    };

    build_reply(request, scope, rcode, flags, &sections, server_nsid).map(Some)
}

/// Build a minimal failure reply for a request rejected before any
/// resolver transaction was started.
pub fn failure(
    request: &Packet,
    scope: ListenerScope,
    rcode: u16,
    server_nsid: Option<&[u8]>,
) -> Result<Packet> {
    let flags = DerivedFlags {
        edns0_do: request.do_bit(),
        aa: false,
        ad: false,
        cd: request.cd(),
    };
    build_reply(
        request,
        scope,
        rcode,
        flags,
        &ReplySections::default(),
        server_nsid,
    )
}

fn reply_max_size(request: &Packet, scope: ListenerScope) -> usize {
    match request.transport {
        Transport::Udp => {
            let client = request.client_udp_size() as usize;
            client.min(scope.advertised_udp_size() as usize)
        }
        Transport::Tcp => TCP_SIZE_MAX,
    }
}

fn build_reply(
    request: &Packet,
    scope: ListenerScope,
    rcode: u16,
    flags: DerivedFlags,
    sections: &ReplySections,
    server_nsid: Option<&[u8]>,
) -> Result<Packet> {
    let has_opt = request.opt.is_some();

    // Without EDNS there is no room for extended rcodes.
    let rcode = if !has_opt && rcode > 0x0F {
        Rcode::SERVFAIL
    } else {
        rcode
    };

    let nsid = if scope.is_primary() {
        request
            .opt
            .as_ref()
            .filter(|opt| opt.nsid_requested())
            .and(server_nsid)
    } else {
        None
    };

    let mut reply = Packet::new(reply_max_size(request, scope), request.transport);
    reply.sender = request.destination;
    reply.destination = request.sender;
    reply.set_id(request.id());
    reply.set_qr(true);
    reply.set_opcode(request.opcode());
    reply.set_rd(request.rd());
    reply.set_ra(true);
    reply.set_aa(flags.aa);
    reply.set_ad(flags.ad);
    reply.set_cd(flags.cd);
    reply.set_rcode((rcode & 0x0F) as u8);

    if has_opt {
        reply.reserve(opt_record_len(nsid.map(<[u8]>::len)));
    }

    fill_body(&mut reply, request, sections, flags.edns0_do)?;

    if has_opt {
        reply.append_opt(scope.advertised_udp_size(), flags.edns0_do, rcode, nsid)?;
    }

    Ok(reply)
}

/// Append question and sections, applying the UDP truncation policy:
/// an unfittable question leaves an empty body with TC; ANSWER overflow
/// sets TC; AUTHORITY overflow sets TC only for DNSSEC-aware clients;
/// ADDITIONAL overflow drops records silently. TCP never sets TC on
/// size grounds.
fn fill_body(
    reply: &mut Packet,
    request: &Packet,
    sections: &ReplySections,
    edns0_do: bool,
) -> Result<()> {
    let udp = reply.transport == Transport::Udp;

    if let Some(question) = request.question() {
        match reply.append_question(question) {
            Ok(()) => {}
            Err(err) if err.is_size_exceeded() => {
                if udp {
                    reply.set_tc(true);
                }
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }

    let (_, outcome) = reply.append_records(&sections.answer, Section::Answer);
    match outcome {
        Ok(()) => {}
        Err(err) if err.is_size_exceeded() => {
            if udp {
                reply.set_tc(true);
            }
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let (_, outcome) = reply.append_records(&sections.authority, Section::Authority);
    match outcome {
        Ok(()) => {}
        Err(err) if err.is_size_exceeded() => {
            if udp && edns0_do {
                reply.set_tc(true);
            }
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let (_, outcome) = reply.append_records(&sections.additional, Section::Additional);
    match outcome {
        Ok(()) => {}
        Err(err) if err.is_size_exceeded() => {}
        Err(err) => return Err(err),
    }

    Ok(())
}

/// Patch and return the upstream packet: client transaction ID, our
/// advertised OPT size, aged TTLs, and a truncating cut if the client
/// cannot take the full size.
fn finish_bypass(request: &Packet, scope: ListenerScope, upstream: &Packet) -> Result<Packet> {
    let mut reply = upstream.duplicate();
    reply.transport = request.transport;
    reply.sender = request.destination;
    reply.destination = request.sender;
    reply.set_id(request.id());
    reply.patch_max_udp_size(scope.advertised_udp_size())?;
    reply.patch_ttls(upstream.timestamp.elapsed())?;

    let limit = match request.transport {
        Transport::Udp => request.client_udp_size() as usize,
        Transport::Tcp => TCP_SIZE_MAX,
    };
    if reply.len() > limit {
        reply.truncate(limit)?;
        reply.set_tc(true);
    }

    Ok(reply)
}
