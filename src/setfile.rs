// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Calibration ("setfile") blobs. A blob holds per-scenario tuning tables for
// several sub-IPs. Layout, all little-endian u32:
//
//   header        v2: magic scenario_num subip_num setfile_offset
//                 v3: magic designed_bit version_code[4] revision_code[4]
//                     scenario_num subip_num setfile_offset
//   scenario tbl  [subip_num][scenario_num] setfile index
//   count tbl     [subip_num] number of setfiles per sub-IP
//   entry tbl     (offset, size) for each setfile, sub-IP 0 first
//   entries       raw tables, starting at setfile_offset
//
// The blob is untrusted input: every field used as a count, index, offset or
// size is bounds-checked before use.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use canonical_error::CanonicalError;

use crate::error::{config_error, corrupt_setfile_error};

pub const SETFILE_V2_MAGIC: u32 = 0x1234_5678;
pub const SETFILE_V3_MAGIC: u32 = 0x1234_5679;
pub const MAX_SCENARIO: u32 = 64;
pub const MAX_SETFILE: u32 = 64;
pub const MAX_SUBIP: u32 = 32;

const V2_HEADER_LEN: usize = 16;
const V3_HEADER_LEN: usize = 28;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetfileVersion {
    V2 = 2,
    V3 = 3,
}

impl SetfileVersion {
    fn header_len(self) -> usize {
        match self {
            SetfileVersion::V2 => V2_HEADER_LEN,
            SetfileVersion::V3 => V3_HEADER_LEN,
        }
    }
}

/// Parsed header, with the table locations resolved to absolute blob offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetfileHeader {
    pub version: SetfileVersion,
    pub num_ips: u32,
    pub num_scenarios: u32,

    /// scenario -> setfile index, for each sub-IP.
    pub scenario_table_base: usize,
    /// Number of setfiles of each sub-IP.
    pub num_setfile_base: usize,
    /// setfile index -> (offset, size).
    pub setfile_table_base: usize,
    /// Start of the raw entries.
    pub setfile_entries_base: usize,

    // v3 only.
    pub designed_bits: u32,
    pub version_code: String,
    pub revision_code: String,
}

fn read_u32(blob: &[u8], at: usize) -> Result<u32, CanonicalError> {
    match at.checked_add(4) {
        Some(end) if end <= blob.len() => Ok((&blob[at..end]).get_u32_le()),
        _ => Err(corrupt_setfile_error(
            format!("read at {} past end of {}-byte setfile", at, blob.len()).as_str())),
    }
}

fn read_code(blob: &[u8], at: usize) -> Result<String, CanonicalError> {
    if at + 4 > blob.len() {
        return Err(corrupt_setfile_error("setfile header truncated"));
    }
    let code = &blob[at..at + 4];
    let len = code.iter().position(|b| *b == 0).unwrap_or(4);
    Ok(String::from_utf8_lossy(&code[..len]).into_owned())
}

pub fn parse_header(blob: &[u8]) -> Result<SetfileHeader, CanonicalError> {
    let magic = read_u32(blob, 0)?;
    let version = match magic {
        SETFILE_V2_MAGIC => SetfileVersion::V2,
        SETFILE_V3_MAGIC => SetfileVersion::V3,
        _ => {
            return Err(corrupt_setfile_error(
                format!("unknown setfile magic {:#010x}", magic).as_str()));
        }
    };
    let (designed_bits, version_code, revision_code, fields_at) = match version {
        SetfileVersion::V2 => (0, String::new(), String::new(), 4),
        SetfileVersion::V3 => (read_u32(blob, 4)?, read_code(blob, 8)?,
                               read_code(blob, 12)?, 16),
    };
    let num_scenarios = read_u32(blob, fields_at)?;
    let num_ips = read_u32(blob, fields_at + 4)?;
    let setfile_offset = read_u32(blob, fields_at + 8)? as usize;
    if num_scenarios == 0 || num_scenarios > MAX_SCENARIO {
        return Err(corrupt_setfile_error(
            format!("scenario count {} out of range", num_scenarios).as_str()));
    }
    if num_ips == 0 || num_ips > MAX_SUBIP {
        return Err(corrupt_setfile_error(
            format!("sub-IP count {} out of range", num_ips).as_str()));
    }

    let scenario_table_base = version.header_len();
    let num_setfile_base =
        scenario_table_base + (num_ips * num_scenarios) as usize * 4;
    let setfile_table_base = num_setfile_base + num_ips as usize * 4;
    let mut total_setfiles = 0usize;
    for ip in 0..num_ips as usize {
        let count = read_u32(blob, num_setfile_base + ip * 4)?;
        if count > MAX_SETFILE {
            return Err(corrupt_setfile_error(
                format!("sub-IP {} claims {} setfiles", ip, count).as_str()));
        }
        total_setfiles += count as usize;
    }
    let tables_end = setfile_table_base + total_setfiles * 8;
    if tables_end > blob.len() {
        return Err(corrupt_setfile_error(
            format!("setfile tables end at {} past {}-byte blob",
                    tables_end, blob.len()).as_str()));
    }
    if setfile_offset < tables_end || setfile_offset > blob.len() {
        return Err(corrupt_setfile_error(
            format!("setfile entry offset {} outside [{}, {}]",
                    setfile_offset, tables_end, blob.len()).as_str()));
    }

    Ok(SetfileHeader{version,
                     num_ips,
                     num_scenarios,
                     scenario_table_base,
                     num_setfile_base,
                     setfile_table_base,
                     setfile_entries_base: setfile_offset,
                     designed_bits,
                     version_code,
                     revision_code})
}

impl SetfileHeader {
    /// Sub-IP table a unit uses. v3 blobs pack tables for the designed units
    /// only, in design-bit order; v2 blobs use the unit's fixed index.
    pub fn subip_index(&self, design_bit: Option<u32>, v2_index: Option<u32>)
                       -> Option<u32> {
        match self.version {
            SetfileVersion::V2 => v2_index,
            SetfileVersion::V3 => {
                let bit = design_bit?;
                if self.designed_bits & (1 << bit) == 0 {
                    return None;
                }
                Some((self.designed_bits & ((1 << bit) - 1)).count_ones())
            },
        }
    }
}

/// Location of one calibration table within the blob.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetfileEntry {
    pub addr: usize,
    pub size: u32,
}

/// Calibration tables of one sub-IP, loaded from a blob.
#[derive(Clone, Debug)]
pub struct IpSetfile {
    pub version: SetfileVersion,
    pub applied_scenario: Option<u32>,
    /// Number of setfiles this sub-IP has.
    pub using_count: u32,
    /// Setfile index used at each scenario.
    pub index: Vec<u32>,
    pub table: Vec<SetfileEntry>,
    blob: Bytes,
}

impl IpSetfile {
    pub fn load(blob: &Bytes, header: &SetfileHeader, subip: u32)
                -> Result<Self, CanonicalError> {
        if subip >= header.num_ips {
            return Err(config_error(
                format!("sub-IP {} not in setfile ({} sub-IPs)",
                        subip, header.num_ips).as_str()));
        }
        let mut first = 0usize;
        for ip in 0..subip as usize {
            first += read_u32(blob, header.num_setfile_base + ip * 4)? as usize;
        }
        let using_count =
            read_u32(blob, header.num_setfile_base + subip as usize * 4)?;

        let row = subip as usize * header.num_scenarios as usize;
        let index = (0..header.num_scenarios as usize)
            .map(|s| read_u32(blob, header.scenario_table_base + (row + s) * 4))
            .collect::<Result<Vec<u32>, CanonicalError>>()?;

        let mut table = Vec::with_capacity(using_count as usize);
        for n in 0..using_count as usize {
            let at = header.setfile_table_base + (first + n) * 8;
            let offset = read_u32(blob, at)? as usize;
            let size = read_u32(blob, at + 4)?;
            let addr = header.setfile_entries_base + offset;
            if addr + size as usize > blob.len() {
                return Err(corrupt_setfile_error(
                    format!("sub-IP {} setfile {} ({}+{}) past end of blob",
                            subip, n, addr, size).as_str()));
            }
            table.push(SetfileEntry{addr, size});
        }
        Ok(IpSetfile{version: header.version,
                     applied_scenario: None,
                     using_count,
                     index,
                     table,
                     blob: blob.clone()})
    }

    pub fn num_scenarios(&self) -> u32 {
        self.index.len() as u32
    }

    pub fn resolve(&self, scenario: u32) -> Result<SetfileEntry, CanonicalError> {
        if scenario >= self.num_scenarios() {
            return Err(config_error(
                format!("scenario {} out of range ({} scenarios)",
                        scenario, self.num_scenarios()).as_str()));
        }
        let setfile_index = self.index[scenario as usize];
        if setfile_index >= self.using_count {
            return Err(config_error(
                format!("scenario {} maps to setfile {} but only {} exist",
                        scenario, setfile_index, self.using_count).as_str()));
        }
        Ok(self.table[setfile_index as usize])
    }

    pub fn data(&self, entry: SetfileEntry) -> Bytes {
        self.blob.slice(entry.addr..entry.addr + entry.size as usize)
    }
}

struct SubIpTables {
    index: Vec<u32>,
    entries: Vec<Vec<u8>>,
}

/// Serialises synthetic setfile blobs, for tooling and tests.
pub struct SetfileBuilder {
    version: SetfileVersion,
    designed_bits: u32,
    version_code: [u8; 4],
    revision_code: [u8; 4],
    num_scenarios: u32,
    sub_ips: Vec<SubIpTables>,
}

fn code_bytes(code: &str) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    for (dst, src) in bytes.iter_mut().zip(code.bytes()) {
        *dst = src;
    }
    bytes
}

impl SetfileBuilder {
    pub fn new(version: SetfileVersion, num_scenarios: u32) -> Self {
        SetfileBuilder{version,
                       designed_bits: 0,
                       version_code: [0; 4],
                       revision_code: [0; 4],
                       num_scenarios,
                       sub_ips: Vec::new()}
    }

    pub fn designed_bits(mut self, bits: u32) -> Self {
        self.designed_bits = bits;
        self
    }

    pub fn codes(mut self, version_code: &str, revision_code: &str) -> Self {
        self.version_code = code_bytes(version_code);
        self.revision_code = code_bytes(revision_code);
        self
    }

    /// Adds the next sub-IP: its scenario -> setfile index map and its raw
    /// setfiles. The index map is padded with zeros to the scenario count.
    pub fn sub_ip(mut self, mut index: Vec<u32>, entries: Vec<Vec<u8>>) -> Self {
        index.resize(self.num_scenarios as usize, 0);
        self.sub_ips.push(SubIpTables{index, entries});
        self
    }

    /// (offset, size) of every setfile, per sub-IP, relative to the entries.
    pub fn layout(&self) -> Vec<Vec<(u32, u32)>> {
        let mut offset = 0u32;
        self.sub_ips.iter().map(|ip| {
            ip.entries.iter().map(|entry| {
                let pair = (offset, entry.len() as u32);
                offset += entry.len() as u32;
                pair
            }).collect()
        }).collect()
    }

    pub fn build(&self) -> Bytes {
        let num_ips = self.sub_ips.len();
        let total_setfiles: usize = self.sub_ips.iter().map(|ip| ip.entries.len()).sum();
        let payload: usize = self.sub_ips.iter()
            .flat_map(|ip| ip.entries.iter()).map(|e| e.len()).sum();
        let tables_len = self.version.header_len()
            + num_ips * self.num_scenarios as usize * 4
            + num_ips * 4
            + total_setfiles * 8;

        let mut buf = BytesMut::with_capacity(tables_len + payload);
        match self.version {
            SetfileVersion::V2 => buf.put_u32_le(SETFILE_V2_MAGIC),
            SetfileVersion::V3 => {
                buf.put_u32_le(SETFILE_V3_MAGIC);
                buf.put_u32_le(self.designed_bits);
                buf.put_slice(&self.version_code);
                buf.put_slice(&self.revision_code);
            },
        }
        buf.put_u32_le(self.num_scenarios);
        buf.put_u32_le(num_ips as u32);
        buf.put_u32_le(tables_len as u32);
        for ip in &self.sub_ips {
            for index in &ip.index {
                buf.put_u32_le(*index);
            }
        }
        for ip in &self.sub_ips {
            buf.put_u32_le(ip.entries.len() as u32);
        }
        for (offset, size) in self.layout().into_iter().flatten() {
            buf.put_u32_le(offset);
            buf.put_u32_le(size);
        }
        for entry in self.sub_ips.iter().flat_map(|ip| ip.entries.iter()) {
            buf.put_slice(entry);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};

    fn sample_v3() -> SetfileBuilder {
        SetfileBuilder::new(SetfileVersion::V3, 4)
            .designed_bits((1 << 3) | (1 << 9))
            .codes("A1", "R07")
            .sub_ip(vec![0, 1, 1, 2], vec![vec![1; 16], vec![2; 8], vec![3; 32]])
            .sub_ip(vec![1, 0, 0, 0], vec![vec![4; 12], vec![5; 4]])
    }

    #[test]
    fn v3_round_trip() {
        let builder = sample_v3();
        let blob = builder.build();
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.version, SetfileVersion::V3);
        assert_eq!(header.num_ips, 2);
        assert_eq!(header.num_scenarios, 4);
        assert_eq!(header.version_code, "A1");
        assert_eq!(header.revision_code, "R07");

        let layout = builder.layout();
        for (subip, expected) in layout.iter().enumerate() {
            let setfile = IpSetfile::load(&blob, &header, subip as u32).unwrap();
            assert_eq!(setfile.using_count as usize, expected.len());
            for scenario in 0..header.num_scenarios {
                let entry = setfile.resolve(scenario).unwrap();
                let (offset, size) = expected[setfile.index[scenario as usize] as usize];
                assert_eq!(entry.addr - header.setfile_entries_base, offset as usize);
                assert_eq!(entry.size, size);
            }
        }
        let isp = IpSetfile::load(&blob, &header, 0).unwrap();
        assert_eq!(isp.data(isp.resolve(3).unwrap()), Bytes::from(vec![3u8; 32]));
    }

    #[test]
    fn v2_header() {
        let blob = SetfileBuilder::new(SetfileVersion::V2, 2)
            .sub_ip(vec![0, 0], vec![vec![9; 4]])
            .build();
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.version, SetfileVersion::V2);
        assert_eq!(header.scenario_table_base, V2_HEADER_LEN);
        assert_eq!(header.designed_bits, 0);
        assert_eq!(header.subip_index(Some(3), Some(0)), Some(0));
    }

    #[test]
    fn unknown_magic_is_corrupt() {
        let mut blob = sample_v3().build().to_vec();
        blob[0] ^= 0xff;
        let err = parse_header(&blob).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::CorruptSetfile);
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let blob = sample_v3().build();
        for len in [2, 20, 40, V3_HEADER_LEN + 8] {
            let err = parse_header(&blob[..len]).unwrap_err();
            assert_eq!(error_kind(&err), ErrorKind::CorruptSetfile, "len {}", len);
        }
    }

    #[test]
    fn entry_past_end_is_corrupt() {
        let builder = sample_v3();
        let blob = builder.build();
        let header = parse_header(&blob).unwrap();
        // Shrink the blob so the last setfile overhangs it.
        let short = blob.slice(..blob.len() - 1);
        assert!(IpSetfile::load(&short, &header, 0).is_ok());
        let err = IpSetfile::load(&short, &header, 1).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::CorruptSetfile);
    }

    #[test]
    fn out_of_range_scenario_and_index() {
        let blob = SetfileBuilder::new(SetfileVersion::V3, 2)
            .sub_ip(vec![0, 5], vec![vec![1; 4]])
            .build();
        let header = parse_header(&blob).unwrap();
        let setfile = IpSetfile::load(&blob, &header, 0).unwrap();
        assert_eq!(error_kind(&setfile.resolve(2).unwrap_err()), ErrorKind::Config);
        assert_eq!(error_kind(&setfile.resolve(1).unwrap_err()), ErrorKind::Config);
        assert!(setfile.resolve(0).is_ok());
        assert_eq!(error_kind(&IpSetfile::load(&blob, &header, 1).unwrap_err()),
                   ErrorKind::Config);
    }

    #[test]
    fn design_bits_select_subip() {
        let blob = sample_v3().build();
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.subip_index(Some(3), None), Some(0));
        assert_eq!(header.subip_index(Some(9), None), Some(1));
        assert_eq!(header.subip_index(Some(4), None), None);
        assert_eq!(header.subip_index(None, Some(1)), None);
    }
}
