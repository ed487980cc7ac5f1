//! `BBP.dir` codec (§4.6): a whole-file text catalog, read on startup and
//! rewritten whole on every full commit.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::descriptor::{Properties, StorageMode2, VarFlags};
use crate::errors::{BbpError, Result};
use crate::types::{
    SlotId, DIR_VERSION, DIR_VERSION_MINMAX_POS, DIR_VERSION_TAILN, SIZEOF_MAX_INT, SIZEOF_OID,
    SIZEOF_SIZE_T,
};

/// Nil OID sentinel written for a min/max position that doesn't apply
/// (§4.6: "written as the nil OID").
pub(crate) const NIL_OID: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct DirHeader {
    pub version: u32,
    pub bbp_size: SlotId,
    pub logno: u64,
    pub transid: u64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub id: SlotId,
    pub status_bits: u32,
    pub name: String,
    pub physical_stem: String,
    pub restrict_flag: u32,
    pub count: u64,
    pub capacity: u64,
    pub hseqbase: u64,
    pub atom_type: String,
    pub width: u16,
    pub var_flags: VarFlags,
    pub properties: Properties,
    pub nokey0: u64,
    pub nokey1: u64,
    pub nosorted: u64,
    pub norevsorted: u64,
    pub seqbase: u64,
    pub tail_free: u64,
    pub tail_size: u64,
    pub tail_storage: StorageMode2,
    pub minpos: Option<u64>,
    pub maxpos: Option<u64>,
    pub vheap: Option<(u64, u64, StorageMode2)>,
    pub options: Option<String>,
}

pub struct Catalog {
    pub header: DirHeader,
    /// Kept in ascending id order, matching the on-disk write order.
    pub entries: BTreeMap<SlotId, DirEntry>,
}

fn storage_to_code(s: StorageMode2) -> u8 {
    match s {
        StorageMode2::MemoryMapped => 0,
        StorageMode2::Private => 1,
        StorageMode2::DirectMapped => 2,
    }
}

fn storage_from_code(c: u8) -> Result<StorageMode2> {
    match c {
        0 => Ok(StorageMode2::MemoryMapped),
        1 => Ok(StorageMode2::Private),
        2 => Ok(StorageMode2::DirectMapped),
        other => Err(BbpError::CatalogMalformed(format!(
            "unknown storage code {other}"
        ))),
    }
}

fn oid_or_nil(v: Option<u64>) -> u64 {
    v.unwrap_or(NIL_OID)
}

fn oid_from_field(v: u64) -> Option<u64> {
    if v == NIL_OID {
        None
    } else {
        Some(v)
    }
}

impl Catalog {
    pub fn empty() -> Self {
        Self {
            header: DirHeader {
                version: DIR_VERSION,
                bbp_size: 1,
                logno: 0,
                transid: 0,
            },
            entries: BTreeMap::new(),
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        writeln!(w, "BBP.dir, GDKversion {}", self.header.version)?;
        writeln!(w, "{SIZEOF_SIZE_T} {SIZEOF_OID} {SIZEOF_MAX_INT}")?;
        writeln!(w, "BBPsize={}", self.header.bbp_size)?;
        writeln!(w, "BBPinfo={} {}", self.header.logno, self.header.transid)?;
        for entry in self.entries.values() {
            write_entry(&mut w, entry)?;
        }
        w.flush()?;
        w.get_ref().sync_data()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let line0 = lines
            .next()
            .ok_or_else(|| BbpError::CatalogMalformed("empty catalog".into()))??;
        let version: u32 = line0
            .rsplit(' ')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BbpError::CatalogMalformed(format!("bad header line: {line0}")))?;
        if version < DIR_VERSION_TAILN {
            return Err(BbpError::VersionTooOld(format!(
                "catalog version {version} predates TAILN ({DIR_VERSION_TAILN})"
            )));
        }
        if version > DIR_VERSION {
            return Err(BbpError::IncompatibleDatabase(format!(
                "catalog version {version} newer than supported {DIR_VERSION}"
            )));
        }

        let line1 = lines
            .next()
            .ok_or_else(|| BbpError::CatalogMalformed("missing size line".into()))??;
        let sizes: Vec<u32> = line1
            .split_whitespace()
            .map(|s| s.parse().unwrap_or(0))
            .collect();
        if sizes.len() != 3 {
            return Err(BbpError::CatalogMalformed(format!(
                "expected 3 size fields, got: {line1}"
            )));
        }
        if sizes[0] != SIZEOF_SIZE_T || sizes[1] != SIZEOF_OID {
            return Err(BbpError::IncompatibleDatabase(format!(
                "catalog built for sizeof(size_t)={}, sizeof(oid)={}, running engine uses {} / {}",
                sizes[0], sizes[1], SIZEOF_SIZE_T, SIZEOF_OID
            )));
        }
        if sizes[2] > SIZEOF_MAX_INT {
            return Err(BbpError::IncompatibleDatabase(format!(
                "catalog max-int width {} exceeds supported {}",
                sizes[2], SIZEOF_MAX_INT
            )));
        }

        let line2 = lines
            .next()
            .ok_or_else(|| BbpError::CatalogMalformed("missing BBPsize line".into()))??;
        let bbp_size: SlotId = line2
            .strip_prefix("BBPsize=")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BbpError::CatalogMalformed(format!("bad BBPsize line: {line2}")))?;

        let line3 = lines
            .next()
            .ok_or_else(|| BbpError::CatalogMalformed("missing BBPinfo line".into()))??;
        let rest = line3
            .strip_prefix("BBPinfo=")
            .ok_or_else(|| BbpError::CatalogMalformed(format!("bad BBPinfo line: {line3}")))?;
        let mut parts = rest.split_whitespace();
        let logno: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BbpError::CatalogMalformed("bad logno".into()))?;
        let transid: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BbpError::CatalogMalformed("bad transid".into()))?;

        let mut entries = BTreeMap::new();
        let has_minmax = version >= DIR_VERSION_MINMAX_POS;
        let mut record = String::new();
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if !line.starts_with(' ') && !record.is_empty() {
                let entry = parse_entry(&record, has_minmax)?;
                entries.insert(entry.id, entry);
                record.clear();
            }
            if !record.is_empty() {
                record.push(' ');
            }
            record.push_str(line.trim());
        }
        if !record.is_empty() {
            let entry = parse_entry(&record, has_minmax)?;
            entries.insert(entry.id, entry);
        }

        Ok(Self {
            header: DirHeader {
                version,
                bbp_size,
                logno,
                transid,
            },
            entries,
        })
    }

    /// Subcommit write (§4.6): merge a pre-image with fresh entries for the
    /// subcommitted set, keeping every other pre-image entry verbatim.
    pub fn merge_subcommit(pre_image: &Catalog, fresh: Vec<DirEntry>) -> Catalog {
        let mut merged = pre_image.entries.clone();
        for entry in fresh {
            merged.insert(entry.id, entry);
        }
        Catalog {
            header: pre_image.header.clone(),
            entries: merged,
        }
    }
}

fn write_entry(w: &mut impl Write, e: &DirEntry) -> Result<()> {
    writeln!(
        w,
        "{} {} {} {} {} {} {} {}",
        e.id,
        e.status_bits,
        e.name,
        e.physical_stem,
        e.restrict_flag,
        e.count,
        e.capacity,
        e.hseqbase
    )?;
    writeln!(
        w,
        "  {} {} {} {} {} {} {} {}",
        e.atom_type,
        e.width,
        e.var_flags.bits(),
        e.properties.bits(),
        e.nokey0,
        e.nokey1,
        e.nosorted,
        e.norevsorted
    )?;
    writeln!(
        w,
        "  {} {} {} {} {} {}",
        e.seqbase,
        e.tail_free,
        e.tail_size,
        storage_to_code(e.tail_storage),
        oid_or_nil(e.minpos),
        oid_or_nil(e.maxpos)
    )?;
    if let Some((free, size, storage)) = e.vheap {
        writeln!(w, "  {} {} {}", free, size, storage_to_code(storage))?;
    }
    if let Some(opts) = &e.options {
        writeln!(w, "  {opts}")?;
    }
    Ok(())
}

fn parse_entry(first_line: &str, has_minmax: bool) -> Result<DirEntry> {
    // Entries are written across several physical lines but each starts a
    // fresh logical record at column 0; callers pass the continuation lines
    // pre-joined by the caller's line iterator through `parse_record`.
    parse_record(first_line, has_minmax)
}

/// Parses one logical record, which `Catalog::read_from` has already
/// reassembled from its (possibly multi-line) on-disk form via
/// [`reassemble_record`].
fn parse_record(record: &str, has_minmax: bool) -> Result<DirEntry> {
    let fields: Vec<&str> = record.split_whitespace().collect();
    let mut i = 0;
    macro_rules! next {
        () => {{
            let v = fields
                .get(i)
                .ok_or_else(|| BbpError::CatalogMalformed(format!("truncated entry: {record}")))?;
            i += 1;
            *v
        }};
    }
    macro_rules! parse_next {
        ($t:ty) => {
            next!()
                .parse::<$t>()
                .map_err(|e| BbpError::CatalogMalformed(format!("{e}: {record}")))?
        };
    }

    let id: SlotId = parse_next!(SlotId);
    let status_bits: u32 = parse_next!(u32);
    let name = next!().to_string();
    let physical_stem = next!().to_string();
    let restrict_flag: u32 = parse_next!(u32);
    let count: u64 = parse_next!(u64);
    let capacity: u64 = parse_next!(u64);
    let hseqbase: u64 = parse_next!(u64);
    let atom_type = next!().to_string();
    let width: u16 = parse_next!(u16);
    let var_flags = VarFlags::from_bits_retain(parse_next!(u32));
    let properties_raw: u32 = parse_next!(u32);
    let properties = Properties::from_bits_retain(properties_raw);
    if properties_raw & !Properties::ALL_KNOWN != 0 {
        return Err(BbpError::IncompatibleDatabase(format!(
            "unknown property bits 0x{:x} for bat {id}",
            properties_raw & !Properties::ALL_KNOWN
        )));
    }
    let nokey0: u64 = parse_next!(u64);
    let nokey1: u64 = parse_next!(u64);
    let nosorted: u64 = parse_next!(u64);
    let norevsorted: u64 = parse_next!(u64);
    let seqbase: u64 = parse_next!(u64);
    let tail_free: u64 = parse_next!(u64);
    let tail_size: u64 = parse_next!(u64);
    let tail_storage = storage_from_code(parse_next!(u8))?;
    let (minpos, maxpos) = if has_minmax {
        let mn = parse_next!(u64);
        let mx = parse_next!(u64);
        (oid_from_field(mn), oid_from_field(mx))
    } else {
        (None, None)
    };
    let vheap = if var_flags.contains(VarFlags::VARWIDTH) {
        let free: u64 = parse_next!(u64);
        let size: u64 = parse_next!(u64);
        let storage = storage_from_code(parse_next!(u8))?;
        Some((free, size, storage))
    } else {
        None
    };
    let options = if i < fields.len() {
        Some(fields[i..].join(" "))
    } else {
        None
    };

    Ok(DirEntry {
        id,
        status_bits,
        name,
        physical_stem,
        restrict_flag,
        count,
        capacity,
        hseqbase,
        atom_type,
        width,
        var_flags,
        properties,
        nokey0,
        nokey1,
        nosorted,
        norevsorted,
        seqbase,
        tail_free,
        tail_size,
        tail_storage,
        minpos,
        maxpos,
        vheap,
        options,
    })
}
