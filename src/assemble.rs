use std::collections::HashSet;

use crate::constants::REDIRECT_MAX;
use crate::dns::{DnsQuestion, DnsRecord, RecordKey, RecordType, names_equal};
use crate::resolver::{AnswerItem, SectionHint};

/// The three reply sections in final emission order. RRSIG sidecars have
/// already been interleaved after their records.
#[derive(Clone, Debug, Default)]
pub struct ReplySections {
    pub answer: Vec<DnsRecord>,
    pub authority: Vec<DnsRecord>,
    pub additional: Vec<DnsRecord>,
}

#[derive(Clone, Debug)]
pub struct Assembly {
    pub sections: ReplySections,
    /// The alias chain exceeded the redirection bound; the reply is
    /// still sent with what was gathered.
    pub redirect_loop: bool,
}

/// A record kept together with its signature sidecar so cross-section
/// deduplication moves them as one unit.
#[derive(Clone, Debug)]
struct Entry {
    record: DnsRecord,
    rrsig: Option<DnsRecord>,
}

impl Entry {
    fn from_item(item: &AnswerItem, edns0_do: bool) -> Self {
        Self {
            record: item.record.clone(),
            rrsig: if edns0_do { item.rrsig.clone() } else { None },
        }
    }
}

/// Project resolver answer items into the three reply sections:
/// flatten the alias chain into ANSWER, place hinted records into
/// AUTHORITY/ADDITIONAL, filter DNSSEC meta-types for clients without
/// DO, and deduplicate record keys across sections.
pub fn assemble(question: &DnsQuestion, items: &[AnswerItem], edns0_do: bool) -> Assembly {
    let mut used = vec![false; items.len()];

    let (answer, redirect_loop) = collect_answer(question, items, &mut used, edns0_do);

    let mut authority: Vec<Entry> = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if used[index] || item.hint != SectionHint::Authority {
            continue;
        }
        if !edns0_do && item.record.rtype.is_dnssec() {
            continue;
        }
        used[index] = true;
        authority.push(Entry::from_item(item, edns0_do));
    }

    let mut additional: Vec<Entry> = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if used[index] {
            continue;
        }
        if !matches!(
            item.hint,
            SectionHint::Answer | SectionHint::Additional | SectionHint::None
        ) {
            continue;
        }
        if !edns0_do && item.record.rtype.is_dnssec() {
            continue;
        }
        used[index] = true;
        additional.push(Entry::from_item(item, edns0_do));
    }

    // Cross-section dedup: a key present in ANSWER evicts the whole
    // RRset from the lower sections, and AUTHORITY evicts ADDITIONAL.
    let answer_keys: HashSet<RecordKey> = answer.iter().map(|e| e.record.key()).collect();
    authority.retain(|e| !answer_keys.contains(&e.record.key()));
    let authority_keys: HashSet<RecordKey> = authority.iter().map(|e| e.record.key()).collect();
    additional.retain(|e| {
        let key = e.record.key();
        !answer_keys.contains(&key) && !authority_keys.contains(&key)
    });

    Assembly {
        sections: ReplySections {
            answer: flatten(answer),
            authority: flatten(authority),
            additional: flatten(additional),
        },
        redirect_loop,
    }
}

/// Scan the pool for records matching the current target name, chasing
/// CNAME/DNAME redirections by restarting the scan with the new target.
/// The chain is bounded; the scan is iterative, never recursive.
fn collect_answer(
    question: &DnsQuestion,
    items: &[AnswerItem],
    used: &mut [bool],
    edns0_do: bool,
) -> (Vec<Entry>, bool) {
    let mut answer: Vec<Entry> = Vec::new();
    let mut target = question.name.clone();
    let mut redirects = 0usize;

    'scan: loop {
        for (index, item) in items.iter().enumerate() {
            if used[index] {
                continue;
            }
            let record = &item.record;
            if !question.class_matches(record.class) {
                continue;
            }
            if !edns0_do && record.rtype.is_dnssec() {
                continue;
            }

            let direct = names_equal(&record.name, &target)
                && (question.qtype == record.rtype || question.qtype == RecordType::ANY);
            if direct {
                used[index] = true;
                answer.push(Entry::from_item(item, edns0_do));
                continue;
            }

            // A query for the alias type itself is answered above, not
            // redirected.
            if question.qtype == record.rtype {
                continue;
            }
            if let Some(next_target) = record.alias_target(&target) {
                if redirects >= REDIRECT_MAX {
                    return (answer, true);
                }
                redirects += 1;
                used[index] = true;
                answer.push(Entry::from_item(item, edns0_do));
                target = next_target;
                continue 'scan;
            }
        }
        break;
    }

    (answer, false)
}

fn flatten(entries: Vec<Entry>) -> Vec<DnsRecord> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        records.push(entry.record);
        if let Some(rrsig) = entry.rrsig {
            records.push(rrsig);
        }
    }
    records
}
