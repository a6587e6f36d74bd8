//! Binary persistence for the index.
//!
//! The format is explicit little-endian with fixed-width fields, independent of
//! the in-memory layout:
//!
//! ```text
//! magic "NPAN" | version u32 | dim u32 | space u8 | m u32 | m0 u32
//! ef_construction u32 | max_elements u64 | count u64 | entry u64 | max_layer u32
//! seed u64
//! count x { top_layer u32 | vector dim x f32 | (top_layer + 1) x { n u32 | n x id u32 } }
//! count x { label u64 | id u32 }
//! tombstone bitmap, ceil(count / 8) bytes, bit (id % 8) of byte (id / 8)
//! crc32 u32 over everything before it
//! ```
//!
//! Decoding builds a complete, validated [`Graph`] before anything is handed
//! back, so callers can swap it in or drop it.

use std::collections::HashSet;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::{IndexConfig, Space};
use crate::distance::Distance;
use crate::error::{Error, Result};
use crate::graph::{EntryPoint, Graph};
use crate::store::{Label, NodeId, NodeStore, StoredElement};

const MAGIC: &[u8; 4] = b"NPAN";
const FORMAT_VERSION: u32 = 1;
const NO_ENTRY: u64 = u64::MAX;

/// Fixed-size header preceding the element records.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    dim: usize,
    space_tag: u8,
    m: usize,
    m0: usize,
    ef_construction: usize,
    max_elements: u64,
    count: u64,
    entry: u64,
    max_layer: usize,
    seed: u64,
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptFile(msg.into())
}

fn truncated(e: std::io::Error) -> Error {
    Error::CorruptFile(format!("truncated index data: {}", e))
}

/// Encode a quiescent graph. The caller holds the exclusive lock.
pub(crate) fn encode(graph: &Graph, space: Space) -> Result<Vec<u8>> {
    let store = &graph.store;
    let count = store.len();
    let dim = store.dim();
    let entry = graph.entry_point();

    let mut buf: Vec<u8> = Vec::with_capacity(64 + count * (dim * 4 + 16 + graph.m0() * 4));

    buf.extend_from_slice(MAGIC);
    buf.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    buf.write_u32::<LittleEndian>(dim as u32)?;
    buf.write_u8(space.to_tag())?;
    buf.write_u32::<LittleEndian>(graph.m() as u32)?;
    buf.write_u32::<LittleEndian>(graph.m0() as u32)?;
    buf.write_u32::<LittleEndian>(graph.ef_construction() as u32)?;
    buf.write_u64::<LittleEndian>(store.capacity() as u64)?;
    buf.write_u64::<LittleEndian>(count as u64)?;
    buf.write_u64::<LittleEndian>(entry.map_or(NO_ENTRY, |e| e.id as u64))?;
    buf.write_u32::<LittleEndian>(entry.map_or(0, |e| e.level) as u32)?;
    buf.write_u64::<LittleEndian>(graph.seed())?;

    for id in 0..count as NodeId {
        let vector = store
            .vector(id)
            .ok_or_else(|| Error::Integrity(format!("slot {} below count is empty", id)))?;
        let links = store.all_links(id);

        buf.write_u32::<LittleEndian>(links.len().saturating_sub(1) as u32)?;
        for &x in vector {
            buf.write_f32::<LittleEndian>(x)?;
        }
        for layer in &links {
            buf.write_u32::<LittleEndian>(layer.len() as u32)?;
            for &n in layer {
                buf.write_u32::<LittleEndian>(n)?;
            }
        }
    }

    for (label, id) in store.label_entries() {
        buf.write_u64::<LittleEndian>(label)?;
        buf.write_u32::<LittleEndian>(id)?;
    }

    let mut bitmap = vec![0u8; count.div_ceil(8)];
    for id in 0..count {
        if store.is_deleted(id as NodeId) {
            bitmap[id / 8] |= 1 << (id % 8);
        }
    }
    buf.extend_from_slice(&bitmap);

    let crc = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(crc)?;

    Ok(buf)
}

fn read_header(cursor: &mut Cursor<&[u8]>) -> Result<Header> {
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic).map_err(truncated)?;
    if &magic != MAGIC {
        return Err(corrupt("bad magic bytes"));
    }

    let version = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    if version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }

    Ok(Header {
        dim: cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize,
        space_tag: cursor.read_u8().map_err(truncated)?,
        m: cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize,
        m0: cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize,
        ef_construction: cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize,
        max_elements: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
        count: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
        entry: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
        max_layer: cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize,
        seed: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
    })
}

/// Decode and validate a graph for an index of the given space and dimension.
///
/// Returns the graph and the construction parameters read from the data.
pub(crate) fn decode(bytes: &[u8], space: Space, dim: usize) -> Result<(Graph, IndexConfig)> {
    if bytes.len() < MAGIC.len() + 4 {
        return Err(corrupt(format!("index data too short: {} bytes", bytes.len())));
    }
    let (payload, footer) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let computed_crc = crc32fast::hash(payload);
    if stored_crc != computed_crc {
        return Err(corrupt(format!(
            "CRC32 mismatch: stored {:#010x}, computed {:#010x}",
            stored_crc, computed_crc
        )));
    }

    let mut cursor = Cursor::new(payload);
    let header = read_header(&mut cursor)?;

    if header.dim != dim {
        return Err(corrupt(format!(
            "dimension mismatch: data has {}, index has {}",
            header.dim, dim
        )));
    }
    match Space::from_tag(header.space_tag) {
        Some(s) if s == space => {}
        Some(s) => {
            return Err(corrupt(format!(
                "space mismatch: data is {}, index is {}",
                s, space
            )))
        }
        None => return Err(corrupt(format!("unknown space tag {}", header.space_tag))),
    }

    let config = IndexConfig {
        m: header.m,
        m0: header.m0,
        ef_construction: header.ef_construction,
        seed: header.seed,
        ..Default::default()
    };
    config
        .validate()
        .map_err(|e| corrupt(format!("invalid parameters: {}", e)))?;

    if header.max_elements > u32::MAX as u64 {
        return Err(corrupt(format!(
            "max_elements {} exceeds the id space",
            header.max_elements
        )));
    }
    if header.count > header.max_elements {
        return Err(corrupt(format!(
            "count {} exceeds max_elements {}",
            header.count, header.max_elements
        )));
    }

    let count = header.count as usize;
    // Every record carries at least a layer count, a vector and one list length.
    let min_record = 8 + dim * 4;
    let remaining = payload.len() - cursor.position() as usize;
    if count.saturating_mul(min_record) > remaining {
        return Err(corrupt(format!(
            "{} elements cannot fit in {} remaining bytes",
            count, remaining
        )));
    }

    let mut elements: Vec<StoredElement> = Vec::with_capacity(count);
    for id in 0..count {
        let top_layer = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let remaining = payload.len() - cursor.position() as usize;
        if top_layer >= remaining / 4 {
            return Err(corrupt(format!("element {} has implausible layer {}", id, top_layer)));
        }

        let mut vector = vec![0f32; dim];
        cursor
            .read_f32_into::<LittleEndian>(&mut vector)
            .map_err(truncated)?;

        let mut links = Vec::with_capacity(top_layer + 1);
        for layer in 0..=top_layer {
            let n = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            let limit = if layer == 0 { config.m0 } else { config.m };
            if n > limit {
                return Err(corrupt(format!(
                    "element {} has {} neighbors at layer {}, limit {}",
                    id, n, layer, limit
                )));
            }
            let mut list = Vec::with_capacity(n);
            for _ in 0..n {
                let neighbor = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
                if neighbor as usize >= count {
                    return Err(corrupt(format!(
                        "element {} links to {} at layer {}, outside [0, {})",
                        id, neighbor, layer, count
                    )));
                }
                list.push(neighbor);
            }
            links.push(list);
        }

        elements.push(StoredElement {
            label: 0,
            vector,
            links,
            deleted: false,
        });
    }

    let mut assigned: Vec<Option<Label>> = vec![None; count];
    let mut seen_labels: HashSet<Label> = HashSet::with_capacity(count);
    for _ in 0..count {
        let label = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let id = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if id >= count {
            return Err(corrupt(format!("label {} maps to id {} outside [0, {})", label, id, count)));
        }
        if assigned[id].is_some() {
            return Err(corrupt(format!("id {} has more than one label", id)));
        }
        if !seen_labels.insert(label) {
            return Err(corrupt(format!("label {} appears twice", label)));
        }
        assigned[id] = Some(label);
    }
    for (element, label) in elements.iter_mut().zip(assigned) {
        element.label = label.ok_or_else(|| corrupt("element without a label"))?;
    }

    let mut bitmap = vec![0u8; count.div_ceil(8)];
    cursor.read_exact(&mut bitmap).map_err(truncated)?;
    for (id, element) in elements.iter_mut().enumerate() {
        element.deleted = bitmap[id / 8] & (1 << (id % 8)) != 0;
    }
    if count % 8 != 0 && bitmap[count / 8] >> (count % 8) != 0 {
        return Err(corrupt("tombstone bitmap has bits set past count"));
    }

    if (cursor.position() as usize) != payload.len() {
        return Err(corrupt(format!(
            "{} trailing bytes after tombstone bitmap",
            payload.len() - cursor.position() as usize
        )));
    }

    let entry = match (header.entry, count) {
        (NO_ENTRY, 0) if header.max_layer == 0 => None,
        (id, n) if n > 0 && id < n as u64 => Some(EntryPoint {
            id: id as NodeId,
            level: header.max_layer,
        }),
        (id, _) => {
            return Err(corrupt(format!(
                "entry point {} invalid for {} elements at layer {}",
                id, count, header.max_layer
            )))
        }
    };

    let store = NodeStore::from_elements(dim, header.max_elements as usize, elements);
    let graph = Graph::from_store(store, Distance::new(space, dim), &config, entry);
    graph.check_invariants().map_err(|e| match e {
        Error::Integrity(msg) => Error::CorruptFile(msg),
        other => other,
    })?;

    Ok((graph, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_graph(n: usize) -> Graph {
        let config = IndexConfig::with_m(4).ef_construction(20).seed(5);
        let graph = Graph::new(Distance::new(Space::L2, 3), n + 2, &config);
        for i in 0..n {
            let x = i as f32;
            graph
                .insert(1000 + i as Label, &[x.sin(), x.cos(), x * 0.1])
                .unwrap();
        }
        if n > 1 {
            graph.store.set_deleted(1, true);
        }
        graph
    }

    fn reseal(bytes: &mut Vec<u8>) {
        let len = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..len]);
        bytes[len..].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_encode_decode_preserves_structure() {
        let graph = build_graph(40);
        let bytes = encode(&graph, Space::L2).unwrap();
        let (decoded, config) = decode(&bytes, Space::L2, 3).unwrap();

        assert_eq!(config.m, 4);
        assert_eq!(config.m0, 8);
        assert_eq!(config.ef_construction, 20);
        assert_eq!(config.seed, 5);
        assert_eq!(decoded.store.len(), 40);
        assert_eq!(decoded.store.capacity(), 42);
        assert_eq!(decoded.entry_point(), graph.entry_point());
        for id in 0..40 {
            assert_eq!(decoded.store.vector(id), graph.store.vector(id));
            assert_eq!(decoded.store.all_links(id), graph.store.all_links(id));
            assert_eq!(decoded.store.label(id), graph.store.label(id));
            assert_eq!(decoded.store.is_deleted(id), id == 1);
        }

        // Re-encoding the decoded graph gives identical bytes.
        assert_eq!(encode(&decoded, Space::L2).unwrap(), bytes);
    }

    #[test]
    fn test_empty_graph() {
        let graph = build_graph(0);
        let bytes = encode(&graph, Space::L2).unwrap();
        let (decoded, _) = decode(&bytes, Space::L2, 3).unwrap();
        assert_eq!(decoded.store.len(), 0);
        assert!(decoded.entry_point().is_none());
    }

    #[test]
    fn test_rejects_mismatched_index() {
        let bytes = encode(&build_graph(10), Space::L2).unwrap();
        assert!(matches!(decode(&bytes, Space::Cosine, 3), Err(Error::CorruptFile(_))));
        assert!(matches!(decode(&bytes, Space::L2, 4), Err(Error::CorruptFile(_))));
    }

    #[test]
    fn test_rejects_crc_mismatch() {
        let mut bytes = encode(&build_graph(10), Space::L2).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        let err = decode(&bytes, Space::L2, 3).unwrap_err();
        assert!(err.to_string().contains("CRC32"), "{}", err);
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = encode(&build_graph(10), Space::L2).unwrap();
        for cut in [0, 3, 20, bytes.len() / 2, bytes.len() - 5] {
            let mut short = bytes[..cut].to_vec();
            if short.len() >= 8 {
                short.extend_from_slice(&[0, 0, 0, 0]);
                reseal(&mut short);
            }
            assert!(
                matches!(decode(&short, Space::L2, 3), Err(Error::CorruptFile(_))),
                "cut at {} accepted",
                cut
            );
        }
    }

    #[test]
    fn test_rejects_out_of_range_neighbor() {
        let graph = build_graph(10);
        let mut bytes = encode(&graph, Space::L2).unwrap();

        // First record starts right after the header: top_layer, vector,
        // then the layer-0 list length and its first neighbor id.
        let header_len = 4 + 4 + 4 + 1 + 4 + 4 + 4 + 8 + 8 + 8 + 4 + 8;
        let first_list = header_len + 4 + 3 * 4;
        let n = u32::from_le_bytes(bytes[first_list..first_list + 4].try_into().unwrap());
        assert!(n > 0);
        bytes[first_list + 4..first_list + 8].copy_from_slice(&999u32.to_le_bytes());
        reseal(&mut bytes);

        let err = decode(&bytes, Space::L2, 3).unwrap_err();
        assert!(err.to_string().contains("outside"), "{}", err);
    }

    const MAX_ELEMENTS_OFFSET: usize = 4 + 4 + 4 + 1 + 4 + 4 + 4;
    const COUNT_OFFSET: usize = MAX_ELEMENTS_OFFSET + 8;

    #[test]
    fn test_large_declared_capacity_is_not_preallocated() {
        let mut bytes = encode(&build_graph(3), Space::L2).unwrap();
        bytes[MAX_ELEMENTS_OFFSET..MAX_ELEMENTS_OFFSET + 8]
            .copy_from_slice(&(u32::MAX as u64).to_le_bytes());
        reseal(&mut bytes);

        let (decoded, _) = decode(&bytes, Space::L2, 3).unwrap();
        assert_eq!(decoded.store.capacity(), u32::MAX as usize);
        assert_eq!(decoded.store.len(), 3);
        decoded.insert(7, &[0.5, 0.5, 0.5]).unwrap();
        decoded.check_invariants().unwrap();
    }

    #[test]
    fn test_rejects_oversized_header_counts() {
        let bytes = encode(&build_graph(3), Space::L2).unwrap();

        let mut huge_capacity = bytes.clone();
        huge_capacity[MAX_ELEMENTS_OFFSET..MAX_ELEMENTS_OFFSET + 8]
            .copy_from_slice(&u64::MAX.to_le_bytes());
        reseal(&mut huge_capacity);
        let err = decode(&huge_capacity, Space::L2, 3).unwrap_err();
        assert!(err.to_string().contains("id space"), "{}", err);

        let mut huge_count = bytes;
        huge_count[MAX_ELEMENTS_OFFSET..MAX_ELEMENTS_OFFSET + 8]
            .copy_from_slice(&(u32::MAX as u64).to_le_bytes());
        huge_count[COUNT_OFFSET..COUNT_OFFSET + 8].copy_from_slice(&(u32::MAX as u64).to_le_bytes());
        reseal(&mut huge_count);
        let err = decode(&huge_count, Space::L2, 3).unwrap_err();
        assert!(err.to_string().contains("cannot fit"), "{}", err);
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = encode(&build_graph(5), Space::L2).unwrap();
        let len = bytes.len() - 4;
        bytes.insert(len, 0);
        reseal(&mut bytes);
        assert!(matches!(decode(&bytes, Space::L2, 3), Err(Error::CorruptFile(_))));
    }
}
