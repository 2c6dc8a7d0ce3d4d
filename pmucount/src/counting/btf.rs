//! Kernel struct layout discovery from BTF
//!
//! The eBPF side walks `task->cgroups->subsys[perf_event_cgrp_id]->cgroup`
//! with plain `bpf_probe_read_kernel` calls, so it needs byte offsets rather
//! than CO-RE relocations. They are looked up once at startup in
//! `/sys/kernel/btf/vmlinux` and handed to the object as a read-only global.
//!
//! Two cgroup layouts exist:
//! - before 6.1: `u64 ancestor_ids[]`, indexed by level
//! - 6.1 and later: `struct cgroup *ancestors[]`, id read from `kn->id`

use log::{debug, warn};
use pmucount_common::{KernelLayout, ANCESTRY_IDS, ANCESTRY_POINTERS};
use std::path::Path;

use crate::config::LayoutOverride;
use crate::domain::{CountingError, LayoutError};

pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

const BTF_MAGIC: u16 = 0xeb9f;
const HEADER_LEN: usize = 24;

const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FWD: u32 = 7;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_FLOAT: u32 = 16;
const KIND_DECL_TAG: u32 = 17;
const KIND_TYPE_TAG: u32 = 18;
const KIND_ENUM64: u32 = 19;

/// Nesting bound for anonymous struct/union members
const MAX_ANON_DEPTH: usize = 8;

#[derive(Debug, Clone)]
struct Member {
    name_off: u32,
    type_id: u32,
    bit_offset: u32,
    bitfield_size: u32,
}

#[derive(Debug, Clone)]
struct Type {
    name_off: u32,
    kind: u32,
    /// Referenced type for modifiers and pointers
    type_ref: u32,
    members: Vec<Member>,
    enumerators: Vec<(u32, i64)>,
}

/// Parsed type and string sections
#[derive(Debug)]
pub struct Btf {
    types: Vec<Type>,
    strings: Vec<u8>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn bytes<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], LayoutError> {
        let end = self.pos.checked_add(N).ok_or(LayoutError::Truncated(what))?;
        let slice = self.data.get(self.pos..end).ok_or(LayoutError::Truncated(what))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, LayoutError> {
        self.bytes::<2>(what).map(u16::from_le_bytes)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, LayoutError> {
        self.bytes::<4>(what).map(u32::from_le_bytes)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), LayoutError> {
        let end = self.pos.checked_add(n).ok_or(LayoutError::Truncated(what))?;
        if end > self.data.len() {
            return Err(LayoutError::Truncated(what));
        }
        self.pos = end;
        Ok(())
    }
}

impl Btf {
    /// Parse a raw little-endian BTF blob
    ///
    /// # Errors
    /// [`LayoutError::BadMagic`], [`LayoutError::Truncated`] or
    /// [`LayoutError::UnknownKind`].
    pub fn parse(data: &[u8]) -> Result<Self, LayoutError> {
        let mut header = Reader::new(data);
        let magic = header.u16("header")?;
        if magic != BTF_MAGIC {
            return Err(LayoutError::BadMagic(magic));
        }
        header.skip(2, "header")?; // version, flags
        let hdr_len = header.u32("header")? as usize;
        if hdr_len < HEADER_LEN {
            return Err(LayoutError::Truncated("header"));
        }
        let type_off = header.u32("header")?;
        let type_len = header.u32("header")?;
        let str_off = header.u32("header")?;
        let str_len = header.u32("header")?;

        let body = data.get(hdr_len..).ok_or(LayoutError::Truncated("header"))?;
        let types = body
            .get(type_off as usize..(type_off as usize).saturating_add(type_len as usize))
            .ok_or(LayoutError::Truncated("type section"))?;
        let strings = body
            .get(str_off as usize..(str_off as usize).saturating_add(str_len as usize))
            .ok_or(LayoutError::Truncated("string section"))?;

        Ok(Self { types: parse_types(types)?, strings: strings.to_vec() })
    }

    /// # Errors
    /// I/O or parse failures of the running kernel's BTF.
    pub fn from_file(path: &Path) -> Result<Self, LayoutError> {
        Self::parse(&std::fs::read(path)?)
    }

    fn name(&self, off: u32) -> &str {
        let Some(tail) = self.strings.get(off as usize..) else {
            return "";
        };
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    fn get(&self, id: u32) -> Option<&Type> {
        // id 0 is void
        self.types.get((id as usize).checked_sub(1)?)
    }

    /// Follow typedefs and qualifiers
    fn strip(&self, mut id: u32) -> Option<&Type> {
        for _ in 0..MAX_ANON_DEPTH {
            let ty = self.get(id)?;
            match ty.kind {
                KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT | KIND_TYPE_TAG => {
                    id = ty.type_ref;
                }
                _ => return Some(ty),
            }
        }
        None
    }

    /// The complete definition of `struct name`
    fn find_struct(&self, name: &'static str) -> Result<&Type, LayoutError> {
        self.types
            .iter()
            .find(|t| {
                t.kind == KIND_STRUCT && !t.members.is_empty() && self.name(t.name_off) == name
            })
            .ok_or(LayoutError::MissingStruct(name))
    }

    fn member_bits(&self, ty: &Type, member: &str, depth: usize) -> Option<(u32, u32)> {
        for m in &ty.members {
            if m.name_off != 0 {
                if self.name(m.name_off) == member {
                    return Some((m.bit_offset, m.bitfield_size));
                }
                continue;
            }
            if depth >= MAX_ANON_DEPTH {
                continue;
            }
            let Some(inner) = self.strip(m.type_id) else { continue };
            if matches!(inner.kind, KIND_STRUCT | KIND_UNION) {
                if let Some((off, size)) = self.member_bits(inner, member, depth + 1) {
                    return Some((m.bit_offset + off, size));
                }
            }
        }
        None
    }

    /// Byte offset of `strukt.member`, looking through anonymous members
    ///
    /// # Errors
    /// [`LayoutError::MissingStruct`], [`LayoutError::MissingMember`] or
    /// [`LayoutError::Bitfield`].
    pub fn member_offset(
        &self,
        strukt: &'static str,
        member: &'static str,
    ) -> Result<u32, LayoutError> {
        let ty = self.find_struct(strukt)?;
        let (bits, bitfield) =
            self.member_bits(ty, member, 0).ok_or(LayoutError::MissingMember { strukt, member })?;
        if bitfield != 0 || bits % 8 != 0 {
            return Err(LayoutError::Bitfield { strukt, member });
        }
        Ok(bits / 8)
    }

    pub fn has_member(&self, strukt: &'static str, member: &'static str) -> bool {
        self.member_offset(strukt, member).is_ok()
    }

    /// Value of the enumerator `name` in any enum
    ///
    /// # Errors
    /// [`LayoutError::MissingEnumerator`].
    pub fn enumerator(&self, name: &'static str) -> Result<i64, LayoutError> {
        self.types
            .iter()
            .filter(|t| matches!(t.kind, KIND_ENUM | KIND_ENUM64))
            .flat_map(|t| t.enumerators.iter())
            .find(|(off, _)| self.name(*off) == name)
            .map(|&(_, value)| value)
            .ok_or(LayoutError::MissingEnumerator(name))
    }
}

fn parse_types(data: &[u8]) -> Result<Vec<Type>, LayoutError> {
    let mut r = Reader::new(data);
    let mut types = Vec::new();

    while !r.done() {
        let name_off = r.u32("type")?;
        let info = r.u32("type")?;
        let size_or_type = r.u32("type")?;
        let vlen = (info & 0xffff) as usize;
        let kind = (info >> 24) & 0x1f;
        let kind_flag = info >> 31 == 1;

        let mut ty = Type {
            name_off,
            kind,
            type_ref: size_or_type,
            members: Vec::new(),
            enumerators: Vec::new(),
        };
        match kind {
            KIND_INT | KIND_VAR | KIND_DECL_TAG => r.skip(4, "type")?,
            KIND_PTR | KIND_FWD | KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT
            | KIND_FUNC | KIND_FLOAT | KIND_TYPE_TAG => {}
            KIND_ARRAY => r.skip(12, "array")?,
            KIND_STRUCT | KIND_UNION => {
                for _ in 0..vlen {
                    let name_off = r.u32("member")?;
                    let type_id = r.u32("member")?;
                    let offset = r.u32("member")?;
                    let (bit_offset, bitfield_size) =
                        if kind_flag { (offset & 0x00ff_ffff, offset >> 24) } else { (offset, 0) };
                    ty.members.push(Member { name_off, type_id, bit_offset, bitfield_size });
                }
            }
            KIND_ENUM => {
                for _ in 0..vlen {
                    let name_off = r.u32("enum")?;
                    let raw = r.u32("enum")?;
                    // signedness is in kind_flag; the ids needed here are small
                    let value = if kind_flag { i64::from(raw as i32) } else { i64::from(raw) };
                    ty.enumerators.push((name_off, value));
                }
            }
            KIND_ENUM64 => {
                for _ in 0..vlen {
                    let name_off = r.u32("enum64")?;
                    let lo = u64::from(r.u32("enum64")?);
                    let hi = u64::from(r.u32("enum64")?);
                    ty.enumerators.push((name_off, ((hi << 32) | lo) as i64));
                }
            }
            KIND_FUNC_PROTO => r.skip(vlen * 8, "func proto")?,
            KIND_DATASEC => r.skip(vlen * 12, "datasec")?,
            other => return Err(LayoutError::UnknownKind(other)),
        }
        types.push(ty);
    }

    Ok(types)
}

/// Offsets of the cgroup walk; any missing piece makes ancestry unavailable
fn cgroup_layout(btf: &Btf, layout: &mut KernelLayout) -> Result<(), LayoutError> {
    let perf_subsys = btf.enumerator("perf_event_cgrp_id")?;
    let perf_subsys = u32::try_from(perf_subsys)
        .map_err(|_| LayoutError::MissingEnumerator("perf_event_cgrp_id"))?;

    layout.task_cgroups = btf.member_offset("task_struct", "cgroups")?;
    layout.css_set_perf_subsys = btf.member_offset("css_set", "subsys")? + perf_subsys * 8;
    layout.css_cgroup = btf.member_offset("cgroup_subsys_state", "cgroup")?;
    layout.cgroup_level = btf.member_offset("cgroup", "level")?;

    if btf.has_member("cgroup", "ancestor_ids") {
        layout.cgroup_ancestors = btf.member_offset("cgroup", "ancestor_ids")?;
        layout.ancestry_kind = ANCESTRY_IDS;
    } else {
        layout.cgroup_ancestors = btf.member_offset("cgroup", "ancestors")?;
        layout.cgroup_kn = btf.member_offset("cgroup", "kn")?;
        layout.kernfs_id = btf.member_offset("kernfs_node", "id")?;
        layout.ancestry_kind = ANCESTRY_POINTERS;
    }
    Ok(())
}

/// Offsets needed by the eBPF programs
///
/// `task_struct.pid` is required. The cgroup walk is best effort: when the
/// kernel lacks any of its fields the layout says so and the cgroup collector
/// resolves no groups.
///
/// # Errors
/// [`LayoutError`] when `task_struct.pid` cannot be found.
pub fn discover_layout(btf: &Btf) -> Result<KernelLayout, LayoutError> {
    let mut layout = KernelLayout {
        task_pid: btf.member_offset("task_struct", "pid")?,
        ..KernelLayout::zeroed()
    };

    if let Err(e) = cgroup_layout(btf, &mut layout) {
        warn!("cgroup ancestry unavailable on this kernel: {e}");
        layout = KernelLayout { task_pid: layout.task_pid, ..KernelLayout::zeroed() };
    }
    debug!("kernel layout: {layout:?}");
    Ok(layout)
}

/// Layout of the running kernel with the optional override applied
///
/// With an override, a missing or unparsable BTF is not fatal.
///
/// # Errors
/// [`CountingError::Layout`] without an override, [`CountingError::Config`]
/// for an invalid override.
pub fn kernel_layout(
    btf_path: &Path,
    layout_override: Option<&LayoutOverride>,
) -> Result<KernelLayout, CountingError> {
    let discovered = Btf::from_file(btf_path).and_then(|btf| discover_layout(&btf));
    let mut layout = match (discovered, layout_override) {
        (Ok(layout), _) => layout,
        (Err(e), Some(_)) => {
            warn!("BTF layout discovery failed ({e}), using the override only");
            KernelLayout::zeroed()
        }
        (Err(e), None) => return Err(e.into()),
    };
    if let Some(over) = layout_override {
        over.apply(&mut layout)?;
    }
    Ok(layout)
}
