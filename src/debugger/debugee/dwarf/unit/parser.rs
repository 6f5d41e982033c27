use crate::debugger::debugee::dwarf::unit::{
    ArrayDie, ArraySubrangeDie, BaseTypeDie, DieAttributes, DieRange, DieRef, DieVariant, Entry,
    EnumTypeDie, EnumeratorDie, FunctionDie, InlineSubroutineDie, LexicalBlockDie, LineRow,
    ModifiedTypeDie, Namespace, ParameterDie, PointerType, StructTypeDie, SubroutineDie,
    TypeDefDie, TypeMemberDie, UnionTypeDie, Unit, UnitLazyPart, UnitProperties, VariableDie,
    END_SEQUENCE, EPILOG_BEGIN, IS_STMT, PROLOG_END,
};
use crate::debugger::debugee::dwarf::EndianArcSlice;
use crate::debugger::error::Error;
use fallible_iterator::FallibleIterator;
use gimli::{
    AttributeValue, DwAt, DwTag, Range, Reader, Unit as GimliUnit, UnitHeader, UnitOffset,
};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Go specific DWARF attribute: runtime kind of a type.
pub(crate) const DW_AT_GO_KIND: DwAt = DwAt(0x2900);

pub struct DwarfUnitParser<'a> {
    dwarf: &'a gimli::Dwarf<EndianArcSlice>,
}

impl<'a> DwarfUnitParser<'a> {
    pub fn new(dwarf: &'a gimli::Dwarf<EndianArcSlice>) -> Self {
        Self { dwarf }
    }

    pub fn parse(&self, header: UnitHeader<EndianArcSlice>) -> gimli::Result<Unit> {
        let unit = self.dwarf.unit(header.clone())?;

        let name = unit
            .name
            .as_ref()
            .and_then(|n| n.to_string_lossy().ok().map(|s| s.to_string()));

        let mut files = vec![];
        let mut lines = vec![];
        if let Some(ref lp) = unit.line_program {
            let mut rows = lp.clone().rows();
            lines = parse_lines(&mut rows)?;
            files = parse_files(self.dwarf, &unit, &rows)?;
        }
        // stable sort to preserve source order of rows at a single address
        lines.sort_by_key(|x| x.address);

        let mut ranges = self
            .dwarf
            .unit_ranges(&unit)?
            .collect::<Vec<_>>()?;
        ranges.sort_unstable_by_key(|r| r.begin);

        let mut cursor = unit.header.entries(&unit.abbreviations);
        cursor.next_dfs()?;
        let root = cursor.current().ok_or(gimli::Error::MissingUnitDie)?;

        let language = root.attr(gimli::DW_AT_language)?.and_then(|attr| {
            if let AttributeValue::Language(lang) = attr.value() {
                return Some(lang);
            }
            None
        });
        let producer = root
            .attr(gimli::DW_AT_producer)?
            .and_then(|attr| self.dwarf.attr_string(&unit, attr.value()).ok())
            .and_then(|s| s.to_string_lossy().ok().map(|s| s.to_string()));

        Ok(Unit {
            id: Uuid::new_v4(),
            name,
            header: Mutex::new(Some(header)),
            idx: usize::MAX,
            properties: UnitProperties {
                encoding: unit.encoding(),
                offset: unit.header.offset().as_debug_info_offset(),
                low_pc: unit.low_pc,
                addr_base: unit.addr_base,
                loclists_base: unit.loclists_base,
                address_size: unit.header.address_size(),
            },
            files,
            lines,
            ranges,
            lazy_part: OnceCell::new(),
            language,
            producer,
        })
    }

    /// Parse all debug information entries of a unit. Called lazily on first demand.
    pub(super) fn parse_additional(
        &self,
        header: UnitHeader<EndianArcSlice>,
    ) -> Result<UnitLazyPart, Error> {
        let unit = self.dwarf.unit(header)?;

        let mut entries: Vec<Entry> = vec![];
        let mut die_ranges: Vec<DieRange> = vec![];
        let mut variable_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut type_index: HashMap<String, UnitOffset> = HashMap::new();
        let mut die_offsets_index: HashMap<UnitOffset, usize> = HashMap::new();
        let mut function_index: HashMap<String, Vec<usize>> = HashMap::new();

        let mut cursor = unit.entries();
        while let Some((delta_depth, die)) = cursor.next_dfs()? {
            let current_idx = entries.len();
            let prev_index = if entries.is_empty() {
                None
            } else {
                Some(entries.len() - 1)
            };

            let name = die
                .attr(gimli::DW_AT_name)?
                .and_then(|attr| self.dwarf.attr_string(&unit, attr.value()).ok())
                .and_then(|s| s.to_string_lossy().ok().map(|s| s.to_string()));

            let parent_idx = match delta_depth {
                // if 1 then previous die is a parent
                1 => prev_index,
                // if 0, then previous die is a sibling
                0 => entries.last().and_then(|dd| dd.node.parent),
                // if < 0 then parent of previous die is a sibling
                mut x if x < 0 => {
                    let mut parent = entries.last().and_then(|dd| dd.node.parent);
                    while x != 0 {
                        parent = parent.and_then(|idx| entries[idx].node.parent);
                        x += 1;
                    }
                    parent
                }
                _ => unreachable!(),
            };

            if let Some(parent_idx) = parent_idx {
                entries[parent_idx].node.children.push(current_idx)
            }

            let ranges: Box<[Range]> = self
                .dwarf
                .die_ranges(&unit, die)?
                .collect::<Vec<Range>>()?
                .into();

            ranges.iter().for_each(|r| {
                die_ranges.push(DieRange {
                    range: *r,
                    die_idx: current_idx,
                })
            });

            let base_attrs = DieAttributes {
                name,
                ranges,
            };

            let go_kind = |die: &gimli::DebuggingInformationEntry<EndianArcSlice>| {
                die.attr(DW_AT_GO_KIND)
                    .ok()
                    .flatten()
                    .and_then(|attr| attr.udata_value())
            };

            let parsed_die = match die.tag() {
                gimli::DW_TAG_subprogram => DieVariant::Function(FunctionDie {
                    decl_file_line: {
                        let file = die.attr(gimli::DW_AT_decl_file)?.and_then(|a| a.udata_value());
                        let line = die.attr(gimli::DW_AT_decl_line)?.and_then(|a| a.udata_value());
                        file.and_then(|f| Some((f, line?)))
                    },
                    fb_addr: die.attr(gimli::DW_AT_frame_base)?,
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_inlined_subroutine => DieVariant::InlineSubroutine(InlineSubroutineDie {
                    base_attributes: base_attrs,
                    abstract_origin: die
                        .attr(gimli::DW_AT_abstract_origin)?
                        .and_then(DieRef::from_attr),
                    call_file: die.attr(gimli::DW_AT_call_file)?.and_then(|a| a.udata_value()),
                    call_line: die.attr(gimli::DW_AT_call_line)?.and_then(|a| a.udata_value()),
                    call_column: die
                        .attr(gimli::DW_AT_call_column)?
                        .and_then(|a| a.udata_value()),
                }),
                gimli::DW_TAG_formal_parameter => DieVariant::Parameter(ParameterDie {
                    base_attributes: base_attrs,
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    location: die.attr(gimli::DW_AT_location)?,
                    fn_block_idx: find_parent(&entries, parent_idx, |die| {
                        matches!(die, DieVariant::Function(_))
                    }),
                }),
                gimli::DW_TAG_variable => {
                    let lexical_block_idx = find_parent(&entries, parent_idx, |die| {
                        matches!(die, DieVariant::LexicalBlock(_))
                    });
                    let fn_block_idx = find_parent(&entries, parent_idx, |die| {
                        matches!(die, DieVariant::Function(_))
                    });

                    let die = VariableDie {
                        base_attributes: base_attrs,
                        type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                        location: die.attr(gimli::DW_AT_location)?,
                        lexical_block_idx,
                        fn_block_idx,
                    };

                    if let Some(ref name) = die.base_attributes.name {
                        variable_index
                            .entry(name.clone())
                            .or_default()
                            .push(current_idx);
                    }

                    DieVariant::Variable(die)
                }
                gimli::DW_TAG_lexical_block => DieVariant::LexicalBlock(LexicalBlockDie {
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_base_type => DieVariant::BaseType(BaseTypeDie {
                    encoding: die.attr(gimli::DW_AT_encoding)?.and_then(|attr| {
                        if let AttributeValue::Encoding(enc) = attr.value() {
                            Some(enc)
                        } else {
                            None
                        }
                    }),
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                    go_kind: go_kind(die),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_structure_type => DieVariant::StructType(StructTypeDie {
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                    go_kind: go_kind(die),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_member => DieVariant::TypeMember(TypeMemberDie {
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                    member_location: die
                        .attr(gimli::DW_AT_data_member_location)?
                        .and_then(|a| a.udata_value()),
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_union_type => DieVariant::UnionType(UnionTypeDie {
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_array_type => DieVariant::ArrayType(ArrayDie {
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                    go_kind: go_kind(die),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_subrange_type => DieVariant::ArraySubrange(ArraySubrangeDie {
                    lower_bound: die.attr(gimli::DW_AT_lower_bound)?,
                    upper_bound: die.attr(gimli::DW_AT_upper_bound)?,
                    count: die.attr(gimli::DW_AT_count)?,
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_enumeration_type => DieVariant::EnumType(EnumTypeDie {
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_enumerator => DieVariant::Enumerator(EnumeratorDie {
                    const_value: die
                        .attr(gimli::DW_AT_const_value)?
                        .and_then(|attr| attr.sdata_value()),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_pointer_type => DieVariant::PointerType(PointerType {
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    go_kind: go_kind(die),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_namespace => DieVariant::Namespace(Namespace {
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_subroutine_type => DieVariant::Subroutine(SubroutineDie {
                    return_type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_typedef => DieVariant::TypeDef(TypeDefDie {
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    go_kind: go_kind(die),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_const_type => DieVariant::ConstType(ModifiedTypeDie {
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_volatile_type => DieVariant::Volatile(ModifiedTypeDie {
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    base_attributes: base_attrs,
                }),
                gimli::DW_TAG_restrict_type => DieVariant::Restrict(ModifiedTypeDie {
                    type_ref: die.attr(gimli::DW_AT_type)?.and_then(DieRef::from_attr),
                    base_attributes: base_attrs,
                }),
                _ => DieVariant::Default(base_attrs),
            };

            // fill name indexes
            match &parsed_die {
                DieVariant::Function(func) => {
                    if let Some(ref name) = func.base_attributes.name {
                        function_index
                            .entry(name.clone())
                            .or_default()
                            .push(current_idx);
                    }
                }
                DieVariant::BaseType(die_ty) => {
                    if let Some(ref name) = die_ty.base_attributes.name {
                        type_index.insert(name.clone(), die.offset());
                    }
                }
                DieVariant::StructType(die_ty) => {
                    if let Some(ref name) = die_ty.base_attributes.name {
                        type_index.insert(name.clone(), die.offset());
                    }
                }
                DieVariant::UnionType(die_ty) => {
                    if let Some(ref name) = die_ty.base_attributes.name {
                        type_index.insert(name.clone(), die.offset());
                    }
                }
                DieVariant::ArrayType(die_ty) => {
                    if let Some(ref name) = die_ty.base_attributes.name {
                        type_index.insert(name.clone(), die.offset());
                    }
                }
                DieVariant::PointerType(die_ty) => {
                    if let Some(ref name) = die_ty.base_attributes.name {
                        type_index.insert(name.clone(), die.offset());
                    }
                }
                DieVariant::TypeDef(die_ty) => {
                    if let Some(ref name) = die_ty.base_attributes.name {
                        type_index.insert(name.clone(), die.offset());
                    }
                }
                _ => {}
            }

            die_offsets_index.insert(die.offset(), current_idx);
            entries.push(Entry::new(parsed_die, die.offset(), parent_idx));
        }

        die_ranges.sort_unstable_by_key(|dr| dr.range.begin);

        entries.shrink_to_fit();
        die_ranges.shrink_to_fit();
        variable_index.shrink_to_fit();
        type_index.shrink_to_fit();
        die_offsets_index.shrink_to_fit();
        function_index.shrink_to_fit();

        Ok(UnitLazyPart {
            entries,
            die_ranges,
            variable_index,
            type_index,
            die_offsets_index,
            function_index,
        })
    }
}

/// Walk up the parent chain starting at `from` until an entry matching the predicate found.
fn find_parent(
    entries: &[Entry],
    from: Option<usize>,
    predicate: impl Fn(&DieVariant) -> bool,
) -> Option<usize> {
    let mut mb_parent = from;
    while let Some(p) = mb_parent {
        if predicate(&entries[p].die) {
            return Some(p);
        }
        mb_parent = entries[p].node.parent;
    }
    None
}

#[inline(always)]
fn parse_lines<R, Offset>(
    rows: &mut gimli::LineRows<R, gimli::IncompleteLineProgram<R, Offset>, Offset>,
) -> gimli::Result<Vec<LineRow>>
where
    R: Reader<Offset = Offset>,
    Offset: gimli::ReaderOffset,
{
    let mut lines = vec![];
    while let Some((_, line_row)) = rows.next_row()? {
        let column = match line_row.column() {
            gimli::ColumnType::LeftEdge => 0,
            gimli::ColumnType::Column(x) => x.get(),
        };

        let mut flags = 0_u8;
        if line_row.is_stmt() {
            flags |= IS_STMT;
        }
        if line_row.prologue_end() {
            flags |= PROLOG_END;
        }
        if line_row.epilogue_begin() {
            flags |= EPILOG_BEGIN;
        }
        if line_row.end_sequence() {
            flags |= END_SEQUENCE;
        }

        lines.push(LineRow {
            address: line_row.address(),
            file_index: line_row.file_index(),
            line: line_row.line().map(NonZeroU64::get).unwrap_or(0),
            column,
            flags,
        })
    }

    lines.shrink_to_fit();
    Ok(lines)
}

#[inline(always)]
fn parse_files<R, Offset>(
    dwarf: &gimli::Dwarf<R>,
    unit: &GimliUnit<R>,
    rows: &gimli::LineRows<R, gimli::IncompleteLineProgram<R, Offset>, Offset>,
) -> gimli::Result<Vec<PathBuf>>
where
    R: Reader<Offset = Offset>,
    Offset: gimli::ReaderOffset,
{
    let mut files = vec![];
    let header = rows.header();
    match header.file(0) {
        Some(file) => files.push(render_file_path(unit, file, header, dwarf)?),
        None => files.push(PathBuf::default()),
    }
    let mut index = 1;
    while let Some(file) = header.file(index) {
        files.push(render_file_path(unit, file, header, dwarf)?);
        index += 1;
    }

    files.shrink_to_fit();
    Ok(files)
}

#[inline(always)]
fn render_file_path<R: Reader>(
    dw_unit: &GimliUnit<R>,
    file: &gimli::FileEntry<R, R::Offset>,
    header: &gimli::LineProgramHeader<R, R::Offset>,
    sections: &gimli::Dwarf<R>,
) -> Result<PathBuf, gimli::Error> {
    let mut path = if let Some(ref comp_dir) = dw_unit.comp_dir {
        PathBuf::from(comp_dir.to_string_lossy()?.as_ref())
    } else {
        PathBuf::new()
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            let dir = sections.attr_string(dw_unit, directory)?;
            let dir = dir.to_string_lossy()?;
            // an absolute directory makes the compilation dir irrelevant
            if dir.starts_with('/') {
                path = PathBuf::from(dir.as_ref());
            } else {
                path.push(dir.as_ref());
            }
        }
    }

    path.push(
        sections
            .attr_string(dw_unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path)
}
