//! Structure layouts from vmlinux DWARF
//!
//! Walks compile units looking for complete definitions of the structures in
//! [`KernelLayout`]. Members of anonymous structs and unions are flattened
//! into their parent with the accumulated offset, so `page.compound_head`
//! (nested two unions deep) is found by name like any other member.

use std::collections::HashMap;

use gimli::{AttributeValue, Reader as _, Unit, UnitOffset};

use super::image::DwarfReader;
use super::layout::{KernelLayout, StructLayout};
use crate::domain::LayoutError;

/// Bound on typedef/cv/anonymous nesting; real kernels need a handful
const MAX_TYPE_DEPTH: usize = 16;

const REQUIRED: [&str; 4] = ["list_head", "kmem_cache", "kmem_cache_cpu", "task_struct"];
const OPTIONAL: [&str; 3] = ["page", "slab", "pcpu_hot"];

type Dwarf = gimli::Dwarf<DwarfReader>;

/// Resolve every structure salt decodes
///
/// # Errors
/// `LayoutError::MissingStruct` when a required structure has no complete
/// definition, `LayoutError::Dwarf` on malformed debug info
pub fn discover_layouts(dwarf: &Dwarf) -> Result<KernelLayout, LayoutError> {
    let wanted: Vec<&str> = REQUIRED.iter().chain(OPTIONAL.iter()).copied().collect();
    let mut found = find_structs(dwarf, &wanted)?;
    let mut required = |name: &str| {
        found.remove(name).ok_or_else(|| LayoutError::MissingStruct(name.to_string()))
    };
    let list_head = required("list_head")?;
    let kmem_cache = required("kmem_cache")?;
    let kmem_cache_cpu = required("kmem_cache_cpu")?;
    let task_struct = required("task_struct")?;

    for name in OPTIONAL {
        if !found.contains_key(name) {
            log::debug!("struct {name} not in debug info");
        }
    }

    Ok(KernelLayout {
        list_head,
        kmem_cache,
        kmem_cache_cpu,
        task_struct,
        page: found.remove("page"),
        slab: found.remove("slab"),
        pcpu_hot: found.remove("pcpu_hot"),
    })
}

/// First complete definition of each named structure
///
/// # Errors
/// `LayoutError::Dwarf` on malformed debug info
pub fn find_structs(
    dwarf: &Dwarf,
    names: &[&str],
) -> Result<HashMap<String, StructLayout>, LayoutError> {
    let mut found: HashMap<String, StructLayout> = HashMap::new();
    let mut headers = dwarf.units();
    while let Some(header) = headers.next()? {
        if found.len() == names.len() {
            break;
        }
        let unit = dwarf.unit(header)?;

        let mut candidates = Vec::new();
        {
            let mut tree = unit.entries_tree(None)?;
            let root = tree.root()?;
            scan_scope(dwarf, &unit, root, names, &found, &mut candidates)?;
        }

        for (name, offset, size) in candidates {
            if found.contains_key(&name) {
                continue;
            }
            let mut layout = StructLayout::new(name.clone(), size);
            collect_members(dwarf, &unit, offset, 0, &mut layout, 0)?;
            log::debug!("struct {name}: {} bytes, {} members", size, layout.field_names().count());
            found.insert(name, layout);
        }
    }
    Ok(found)
}

/// Collect top-level (or namespace-level) structure definitions we want
fn scan_scope(
    dwarf: &Dwarf,
    unit: &Unit<DwarfReader>,
    node: gimli::EntriesTreeNode<'_, '_, '_, DwarfReader>,
    names: &[&str],
    found: &HashMap<String, StructLayout>,
    out: &mut Vec<(String, UnitOffset, u64)>,
) -> Result<(), LayoutError> {
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        match entry.tag() {
            gimli::DW_TAG_namespace => scan_scope(dwarf, unit, child, names, found, out)?,
            gimli::DW_TAG_structure_type => {
                if is_declaration(entry)? {
                    continue;
                }
                let Some(name) = entry_name(dwarf, unit, entry)? else {
                    continue;
                };
                if !names.contains(&name.as_str()) || found.contains_key(&name) {
                    continue;
                }
                if out.iter().any(|(n, _, _)| *n == name) {
                    continue;
                }
                let Some(size) = entry.attr_value(gimli::DW_AT_byte_size)?.and_then(|v| v.udata_value())
                else {
                    continue;
                };
                out.push((name, entry.offset(), size));
            }
            _ => {}
        }
    }
    Ok(())
}

fn collect_members(
    dwarf: &Dwarf,
    unit: &Unit<DwarfReader>,
    offset: UnitOffset,
    base: u64,
    layout: &mut StructLayout,
    depth: usize,
) -> Result<(), LayoutError> {
    if depth > MAX_TYPE_DEPTH {
        return Ok(());
    }
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_member {
            continue;
        }
        if entry.attr(gimli::DW_AT_bit_size)?.is_some() {
            continue;
        }
        let member_offset = base + member_location(unit, entry)?;
        let Some(type_offset) = type_ref(entry)? else {
            continue;
        };
        match entry_name(dwarf, unit, entry)? {
            Some(name) => {
                if let Some(width) = type_size(unit, type_offset, 0)? {
                    layout.insert_field(&name, member_offset, width);
                }
            }
            None => {
                if let Some(aggregate) = strip_typedefs(unit, type_offset, 0)? {
                    collect_members(dwarf, unit, aggregate, member_offset, layout, depth + 1)?;
                }
            }
        }
    }
    Ok(())
}

fn member_location(
    unit: &Unit<DwarfReader>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfReader>,
) -> Result<u64, LayoutError> {
    match entry.attr_value(gimli::DW_AT_data_member_location)? {
        None => Ok(0),
        Some(AttributeValue::Exprloc(expr)) => {
            let mut ops = expr.operations(unit.encoding());
            match ops.next()? {
                Some(gimli::Operation::PlusConstant { value }) => Ok(value),
                _ => Ok(0),
            }
        }
        Some(value) => Ok(value.udata_value().unwrap_or(0)),
    }
}

fn type_ref(
    entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfReader>,
) -> Result<Option<UnitOffset>, LayoutError> {
    match entry.attr_value(gimli::DW_AT_type)? {
        Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        _ => Ok(None),
    }
}

/// Byte width of a type, following typedef and cv-qualifier chains
fn type_size(
    unit: &Unit<DwarfReader>,
    offset: UnitOffset,
    depth: usize,
) -> Result<Option<u64>, LayoutError> {
    if depth > MAX_TYPE_DEPTH {
        return Ok(None);
    }
    let entry = unit.entry(offset)?;
    if let Some(size) = entry.attr_value(gimli::DW_AT_byte_size)?.and_then(|v| v.udata_value()) {
        return Ok(Some(size));
    }
    match entry.tag() {
        gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => {
            Ok(Some(u64::from(unit.encoding().address_size)))
        }
        gimli::DW_TAG_typedef
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_volatile_type
        | gimli::DW_TAG_restrict_type
        | gimli::DW_TAG_atomic_type => match type_ref(&entry)? {
            Some(inner) => type_size(unit, inner, depth + 1),
            None => Ok(None),
        },
        gimli::DW_TAG_array_type => {
            let Some(element) = type_ref(&entry)? else {
                return Ok(None);
            };
            let Some(element_size) = type_size(unit, element, depth + 1)? else {
                return Ok(None);
            };
            Ok(Some(element_size * array_count(unit, offset)?))
        }
        _ => Ok(None),
    }
}

/// Product of all subrange lengths; flexible arrays count as zero
fn array_count(unit: &Unit<DwarfReader>, offset: UnitOffset) -> Result<u64, LayoutError> {
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let mut children = root.children();
    let mut count = 1u64;
    let mut saw_range = false;
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_subrange_type {
            continue;
        }
        saw_range = true;
        let len = if let Some(n) = entry.attr_value(gimli::DW_AT_count)?.and_then(|v| v.udata_value())
        {
            n
        } else if let Some(upper) =
            entry.attr_value(gimli::DW_AT_upper_bound)?.and_then(|v| v.udata_value())
        {
            upper + 1
        } else {
            0
        };
        count = count.saturating_mul(len);
    }
    Ok(if saw_range { count } else { 0 })
}

/// Follow typedefs/cv qualifiers to a struct or union definition
fn strip_typedefs(
    unit: &Unit<DwarfReader>,
    offset: UnitOffset,
    depth: usize,
) -> Result<Option<UnitOffset>, LayoutError> {
    if depth > MAX_TYPE_DEPTH {
        return Ok(None);
    }
    let entry = unit.entry(offset)?;
    match entry.tag() {
        gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => Ok(Some(offset)),
        gimli::DW_TAG_typedef
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_volatile_type
        | gimli::DW_TAG_atomic_type => match type_ref(&entry)? {
            Some(inner) => strip_typedefs(unit, inner, depth + 1),
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

fn is_declaration(
    entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfReader>,
) -> Result<bool, LayoutError> {
    Ok(matches!(entry.attr_value(gimli::DW_AT_declaration)?, Some(AttributeValue::Flag(true))))
}

fn entry_name(
    dwarf: &Dwarf,
    unit: &Unit<DwarfReader>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfReader>,
) -> Result<Option<String>, LayoutError> {
    let Some(value) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let raw = dwarf.attr_string(unit, value)?;
    Ok(Some(raw.to_string_lossy()?.into_owned()))
}
