//! Request planning.
//!
//! A read or write call arrives as N resolved addresses. The planner turns them
//! into the fewest wire requests that respect the connection's payload size:
//!
//! - one item that fits becomes a plain service request,
//! - several items that fit together share a Multiple Service Packet,
//! - an item too large for any packet is transferred in fragments.
//!
//! Each wire request is a *slot*. Identical reads share a slot and bit writes
//! to the same host element are merged into one Read Modify Write slot, so the
//! plan carries a slot → caller table used to fan results back out.

use std::collections::HashMap;

use log::debug;

use crate::codec::PlcValue;
use crate::command::{
    Service, TypeCode, MULTI_OFFSET_SIZE, MULTI_REPLY_OVERHEAD, MULTI_REQUEST_OVERHEAD,
};
use crate::encoder::{encode_write, EncodedWrite};
use crate::error::CipError;
use crate::symbols::SymbolCache;
use crate::tag::TagAddress;
use crate::utils::set_bit;

/// Reply header of a single service: service, reserved, status, ext size.
const REPLY_HEADER_SIZE: usize = 4;
/// Fixed part of a fragmented write request besides path and type header:
/// service, path size, element count and offset.
const FRAGMENTED_WRITE_OVERHEAD: usize = 2 + 2 + 4;

/// Request and reply bytes of one item sent on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemCost {
    /// Encoded request size.
    pub request: usize,
    /// Expected reply size.
    pub reply: usize,
}

/// Grouping decided by [`pack`], as indices into its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    /// Sent as a plain request.
    Single(usize),
    /// Sent together in one Multiple Service Packet.
    Multi(Vec<usize>),
    /// Too large for one packet.
    Fragmented(usize),
}

/// Groups items into batches that fit `payload_size`.
///
/// An item that does not fit a packet alone is fragmented by itself. Other
/// items accumulate into the current batch, which closes as soon as the next
/// item would push its request or reply past the packet size once the
/// multi-service header and offset entries are counted. A batch holding one
/// item is sent as a plain request. Fragmented items are emitted when seen,
/// ahead of the batch still being filled.
///
/// # Example
///
/// ```
/// use logix_cip::planner::{pack, Batch, ItemCost};
///
/// let cost = |reply| ItemCost { request: 20, reply };
/// let batches = pack(&[cost(100), cost(100), cost(600)], 500);
/// assert_eq!(batches, [Batch::Fragmented(2), Batch::Multi(vec![0, 1])]);
/// ```
pub fn pack(items: &[ItemCost], payload_size: usize) -> Vec<Batch> {
    let request_budget = payload_size.saturating_sub(MULTI_REQUEST_OVERHEAD);
    let reply_budget = payload_size.saturating_sub(MULTI_REPLY_OVERHEAD);

    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let (mut request_total, mut reply_total) = (0, 0);

    let close = |current: &mut Vec<usize>, batches: &mut Vec<Batch>| match current.len() {
        0 => {}
        1 => batches.push(Batch::Single(current[0])),
        _ => batches.push(Batch::Multi(std::mem::take(current))),
    };

    for (i, cost) in items.iter().enumerate() {
        if cost.request > payload_size || cost.reply > payload_size {
            batches.push(Batch::Fragmented(i));
            continue;
        }
        let request = cost.request + MULTI_OFFSET_SIZE;
        let reply = cost.reply + MULTI_OFFSET_SIZE;
        if !current.is_empty()
            && (request_total + request > request_budget || reply_total + reply > reply_budget)
        {
            close(&mut current, &mut batches);
            current.clear();
            request_total = 0;
            reply_total = 0;
        }
        current.push(i);
        request_total += request;
        reply_total += reply;
    }
    close(&mut current, &mut batches);
    batches
}

/// One wire request of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A plain service request.
    Single {
        /// Slot answered by the reply.
        slot: usize,
        /// Read, Write or Read Modify Write service.
        service: Service,
    },
    /// Several services in one Multiple Service Packet.
    MultiService(Vec<(usize, Service)>),
    /// Read Tag Fragmented, repeated until the controller reports success.
    FragmentedRead {
        /// Slot answered by the reassembled reply.
        slot: usize,
        /// Encoded tag path.
        path: Vec<u8>,
        /// Element count.
        elements: u16,
    },
    /// Write Tag Fragmented, one request per chunk of `payload`.
    FragmentedWrite {
        /// Slot answered once the last chunk is accepted.
        slot: usize,
        /// Encoded tag path.
        path: Vec<u8>,
        /// Type header.
        type_code: TypeCode,
        /// Element count.
        elements: u16,
        /// Whole encoded value.
        payload: Vec<u8>,
        /// Bytes per chunk (a whole number of elements when possible).
        chunk_size: usize,
    },
}

impl Request {
    /// Splits a fragmented write into its per-chunk services.
    pub fn write_fragments(&self) -> Vec<Service> {
        let Request::FragmentedWrite {
            path,
            type_code,
            elements,
            payload,
            chunk_size,
            ..
        } = self
        else {
            return Vec::new();
        };
        payload
            .chunks((*chunk_size).max(1))
            .enumerate()
            .map(|(i, chunk)| Service::WriteFragmented {
                path: path.clone(),
                type_code: *type_code,
                elements: *elements,
                offset: (i * chunk_size) as u32,
                data: chunk.to_vec(),
            })
            .collect()
    }
}

/// Planner output.
#[derive(Debug, Default)]
pub struct Plan {
    /// Wire requests, in send order.
    pub requests: Vec<Request>,
    /// For each slot, the caller indices it answers.
    pub callers: Vec<Vec<usize>>,
    /// Items rejected before any traffic (encoding or size errors).
    pub rejected: Vec<(usize, CipError)>,
}

impl Plan {
    /// Number of slots.
    pub fn slots(&self) -> usize {
        self.callers.len()
    }

    fn add_caller(&mut self, slot: usize, caller: usize) {
        if !self.callers[slot].contains(&caller) {
            self.callers[slot].push(caller);
        }
    }
}

/// Work for one slot before packing.
#[derive(Debug)]
enum SlotWork {
    Read {
        path: Vec<u8>,
        elements: u16,
        reply: usize,
    },
    Write {
        path: Vec<u8>,
        type_code: TypeCode,
        elements: u16,
        element_size: usize,
        data: Vec<u8>,
    },
    Mask {
        path: Vec<u8>,
        or_mask: u64,
        and_mask: u64,
        width: usize,
    },
}

impl SlotWork {
    fn service(&self) -> Service {
        match self {
            SlotWork::Read { path, elements, .. } => Service::Read {
                path: path.clone(),
                elements: *elements,
            },
            SlotWork::Write {
                path,
                type_code,
                elements,
                data,
                ..
            } => Service::Write {
                path: path.clone(),
                type_code: *type_code,
                elements: *elements,
                data: data.clone(),
            },
            SlotWork::Mask {
                path,
                or_mask,
                and_mask,
                width,
            } => Service::ReadModifyWrite {
                path: path.clone(),
                or_mask: or_mask.to_le_bytes()[..*width].to_vec(),
                and_mask: and_mask.to_le_bytes()[..*width].to_vec(),
            },
        }
    }

    fn cost(&self) -> ItemCost {
        let request = self.service().encoded_len();
        let reply = match self {
            SlotWork::Read { reply, .. } => *reply,
            _ => REPLY_HEADER_SIZE,
        };
        ItemCost { request, reply }
    }

    fn into_fragmented(self, slot: usize, payload_size: usize) -> Request {
        match self {
            SlotWork::Read { path, elements, .. } => Request::FragmentedRead {
                slot,
                path,
                elements,
            },
            SlotWork::Write {
                path,
                type_code,
                elements,
                element_size,
                data,
            } => {
                let overhead = FRAGMENTED_WRITE_OVERHEAD + path.len() + type_code.encoded_len();
                let room = payload_size.saturating_sub(overhead).max(1);
                let chunk_size = if element_size > 0 && element_size <= room {
                    room - room % element_size
                } else {
                    room
                };
                Request::FragmentedWrite {
                    slot,
                    path,
                    type_code,
                    elements,
                    payload: data,
                    chunk_size,
                }
            }
            // masks are a few bytes and always fit
            mask @ SlotWork::Mask { .. } => Request::Single {
                slot,
                service: mask.service(),
            },
        }
    }
}

fn assemble(mut plan: Plan, work: Vec<SlotWork>, payload_size: usize) -> Plan {
    let costs: Vec<ItemCost> = work.iter().map(SlotWork::cost).collect();
    let batches = pack(&costs, payload_size);
    let mut work: Vec<Option<SlotWork>> = work.into_iter().map(Some).collect();

    for batch in batches {
        let request = match batch {
            Batch::Single(slot) => work[slot].as_ref().map(|w| Request::Single {
                slot,
                service: w.service(),
            }),
            Batch::Multi(slots) => Some(Request::MultiService(
                slots
                    .into_iter()
                    .filter_map(|slot| work[slot].as_ref().map(|w| (slot, w.service())))
                    .collect(),
            )),
            Batch::Fragmented(slot) => work[slot]
                .take()
                .map(|w| w.into_fragmented(slot, payload_size)),
        };
        plan.requests.extend(request);
    }
    debug!(
        "planned {} slots into {} requests ({} rejected)",
        plan.slots(),
        plan.requests.len(),
        plan.rejected.len()
    );
    plan
}

/// Plans reads of `tags`, given as `(caller index, address)`.
///
/// Reads with the same path and element count share one slot.
pub fn plan_reads(
    tags: &[(usize, &TagAddress)],
    symbols: &SymbolCache,
    payload_size: usize,
) -> Plan {
    let mut plan = Plan::default();
    let mut work = Vec::new();
    let mut seen: HashMap<(Vec<u8>, u16), usize> = HashMap::new();

    for &(caller, address) in tags {
        let prepared = address.request_path().and_then(|path| {
            let element_size = address.element_size(symbols)?;
            let header = if address.is_struct() { 4 } else { 2 };
            Ok((path, REPLY_HEADER_SIZE + header + element_size * address.elements as usize))
        });
        let (path, reply) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                plan.rejected.push((caller, e));
                continue;
            }
        };
        let key = (path, address.elements);
        if let Some(&slot) = seen.get(&key) {
            plan.add_caller(slot, caller);
            continue;
        }
        let slot = plan.callers.len();
        plan.callers.push(vec![caller]);
        seen.insert(key.clone(), slot);
        work.push(SlotWork::Read {
            path: key.0,
            elements: address.elements,
            reply,
        });
    }
    assemble(plan, work, payload_size)
}

/// Plans writes of `(caller index, address, value)`.
///
/// Bit writes to the same host element are folded into one Read Modify Write
/// whose OR mask holds the bits to set and whose AND mask clears the rest.
pub fn plan_writes(
    writes: &[(usize, &TagAddress, &PlcValue)],
    symbols: &SymbolCache,
    payload_size: usize,
) -> Plan {
    let mut plan = Plan::default();
    let mut work = Vec::new();
    let mut masks: HashMap<Vec<u8>, usize> = HashMap::new();

    for &(caller, address, value) in writes {
        let encoded = match encode_write(address, value, symbols) {
            Ok(encoded) => encoded,
            Err(e) => {
                plan.rejected.push((caller, e));
                continue;
            }
        };
        match encoded {
            EncodedWrite::Value {
                type_code,
                elements,
                element_size,
                data,
            } => {
                let path = match address.request_path() {
                    Ok(path) => path,
                    Err(e) => {
                        plan.rejected.push((caller, e));
                        continue;
                    }
                };
                plan.callers.push(vec![caller]);
                work.push(SlotWork::Write {
                    path,
                    type_code,
                    elements,
                    element_size,
                    data,
                });
            }
            EncodedWrite::Bits(bits) => {
                for bit in bits {
                    let slot = *masks.entry(bit.path.clone()).or_insert_with(|| {
                        plan.callers.push(Vec::new());
                        work.push(SlotWork::Mask {
                            path: bit.path.clone(),
                            or_mask: 0,
                            and_mask: u64::MAX,
                            width: bit.width,
                        });
                        work.len() - 1
                    });
                    if let SlotWork::Mask {
                        or_mask, and_mask, ..
                    } = &mut work[slot]
                    {
                        *or_mask = set_bit(*or_mask, bit.bit, bit.state);
                        *and_mask = set_bit(*and_mask, bit.bit, bit.state);
                    }
                    plan.add_caller(slot, caller);
                }
            }
        }
    }
    assemble(plan, work, payload_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{STANDARD_PAYLOAD_SIZE, SERVICE_READ_MODIFY_WRITE};
    use crate::tag::tests::sample_symbols;

    fn cost(reply: usize) -> ItemCost {
        ItemCost { request: 10, reply }
    }

    fn parse_all(texts: &[&str], symbols: &SymbolCache) -> Vec<TagAddress> {
        texts
            .iter()
            .map(|t| TagAddress::parse(t, symbols).unwrap())
            .collect()
    }

    #[test]
    fn test_pack_single_and_empty() {
        assert!(pack(&[], 500).is_empty());
        assert_eq!(pack(&[cost(10)], 500), [Batch::Single(0)]);
    }

    #[test]
    fn test_pack_batch_boundary() {
        // batched replies cost reply + 2; the budget is 500 - 6
        let budget = STANDARD_PAYLOAD_SIZE - MULTI_REPLY_OVERHEAD;
        let first = cost(budget - 1 - 100 - 2 * MULTI_OFFSET_SIZE);
        let items = [first, cost(100), cost(0)];
        let batches = pack(&items, STANDARD_PAYLOAD_SIZE);
        assert_eq!(batches, [Batch::Multi(vec![0, 1]), Batch::Single(2)]);

        // shrinking the first item makes room for all three
        let fits = [cost(budget - 2 - 100 - 3 * MULTI_OFFSET_SIZE), cost(100), cost(0)];
        assert_eq!(pack(&fits, STANDARD_PAYLOAD_SIZE), [Batch::Multi(vec![0, 1, 2])]);
    }

    #[test]
    fn test_pack_request_side_limit() {
        let big_request = ItemCost { request: 300, reply: 10 };
        let batches = pack(&[big_request, big_request], 500);
        assert_eq!(batches, [Batch::Single(0), Batch::Single(1)]);
    }

    #[test]
    fn test_pack_fragments_oversized_alone() {
        let batches = pack(&[cost(10), cost(501), cost(10)], 500);
        assert_eq!(batches, [Batch::Fragmented(1), Batch::Multi(vec![0, 2])]);
    }

    #[test]
    fn test_plan_reads_folds_duplicates() {
        let symbols = sample_symbols();
        let tags = parse_all(
            &["Counter", "Speed", "Counter", "MyArray[0]{2}", "MyArray[0]"],
            &symbols,
        );
        let indexed: Vec<(usize, &TagAddress)> = tags.iter().enumerate().collect();
        let plan = plan_reads(&indexed, &symbols, STANDARD_PAYLOAD_SIZE);

        assert_eq!(plan.slots(), 4);
        assert_eq!(plan.callers[0], [0, 2]);
        assert_eq!(plan.requests.len(), 1);
        let Request::MultiService(services) = &plan.requests[0] else {
            panic!("expected one batch");
        };
        assert_eq!(services.len(), 4);
    }

    #[test]
    fn test_plan_reads_fragments_large_reply() {
        let symbols = sample_symbols();
        let tags = parse_all(&["Counter", "MyArray{10}", "Speed"], &symbols);
        let indexed: Vec<(usize, &TagAddress)> = tags.iter().enumerate().collect();
        // MyArray{10} replies 4 + 2 + 40 bytes, more than a 40 byte packet
        let plan = plan_reads(&indexed, &symbols, 40);
        assert_eq!(plan.requests.len(), 2);
        assert_eq!(
            plan.requests[0],
            Request::FragmentedRead {
                slot: 1,
                path: tags[1].request_path().unwrap(),
                elements: 10,
            }
        );
        let Request::MultiService(services) = &plan.requests[1] else {
            panic!("expected a batch");
        };
        let slots: Vec<usize> = services.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, [0, 2]);
    }

    #[test]
    fn test_plan_writes_coalesces_bits() {
        let symbols = sample_symbols();
        let tags = parse_all(&["Counter.0", "Counter.3", "Speed", "Counter.3"], &symbols);
        let values = [
            PlcValue::Bool(true),
            PlcValue::Bool(true),
            PlcValue::Real(2.0),
            PlcValue::Bool(false),
        ];
        let writes: Vec<(usize, &TagAddress, &PlcValue)> = tags
            .iter()
            .zip(&values)
            .enumerate()
            .map(|(i, (t, v))| (i, t, v))
            .collect();
        let plan = plan_writes(&writes, &symbols, STANDARD_PAYLOAD_SIZE);

        assert_eq!(plan.slots(), 2);
        assert_eq!(plan.callers[0], [0, 1, 3]);
        let Request::MultiService(services) = &plan.requests[0] else {
            panic!("expected one batch");
        };
        let (_, rmw) = &services[0];
        assert_eq!(rmw.code(), SERVICE_READ_MODIFY_WRITE);
        // bit 0 set; bit 3 set then cleared
        assert_eq!(
            rmw,
            &Service::ReadModifyWrite {
                path: tags[0].request_path().unwrap(),
                or_mask: vec![0x01, 0x00, 0x00, 0x00],
                and_mask: vec![0xF7, 0xFF, 0xFF, 0xFF],
            }
        );
    }

    #[test]
    fn test_plan_writes_rejects_bad_values() {
        let symbols = sample_symbols();
        let tags = parse_all(&["Counter", "Speed"], &symbols);
        let values = [PlcValue::String("x".into()), PlcValue::Real(1.0)];
        let writes = [(0, &tags[0], &values[0]), (1, &tags[1], &values[1])];
        let plan = plan_writes(&writes, &symbols, STANDARD_PAYLOAD_SIZE);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].0, 0);
        assert!(matches!(plan.requests[0], Request::Single { slot: 0, .. }));
        assert_eq!(plan.callers[0], [1]);
    }

    #[test]
    fn test_fragmented_write_chunks() {
        let symbols = sample_symbols();
        let tags = parse_all(&["MyArray{10}"], &symbols);
        let value = PlcValue::Array((0..10).map(PlcValue::Dint).collect());
        let plan = plan_writes(&[(0, &tags[0], &value)], &symbols, 40);
        let request = &plan.requests[0];
        let Request::FragmentedWrite { chunk_size, .. } = request else {
            panic!("expected a fragmented write");
        };
        // 40 - 8 - 10 (path) - 2 (type) = 20, already a multiple of 4
        assert_eq!(*chunk_size, 20);
        let fragments = request.write_fragments();
        assert_eq!(fragments.len(), 2);
        assert!(matches!(fragments[1], Service::WriteFragmented { offset: 20, .. }));
    }
}
