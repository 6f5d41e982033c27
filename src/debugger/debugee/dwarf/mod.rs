pub mod eval;
pub mod loader;
mod symbol;
pub mod r#type;
pub mod unit;
pub mod unwind;

pub use self::unwind::DwarfUnwinder;
pub use symbol::Symbol;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::eval::AddressKind;
use crate::debugger::debugee::dwarf::r#type::ComplexType;
use crate::debugger::debugee::dwarf::symbol::SymbolTab;
use crate::debugger::debugee::dwarf::unit::{
    DieRef, DieVariant, DwarfUnitParser, Entry, FunctionDie, InlineSubroutineDie, Node,
    ParameterDie, PlaceDescriptorOwned, Unit, VariableDie,
};
use crate::debugger::debugee::{Debugee, Location};
use crate::debugger::error::Error;
use crate::debugger::register::{DwarfRegisterMap, RegisterMap};
use crate::debugger::ExplorationContext;
use crate::{resolve_unit_call, weak_error};
use bytes::Bytes;
use fallible_iterator::FallibleIterator;
use gimli::CfaRule::RegisterAndOffset;
use gimli::{
    Attribute, BaseAddresses, CfaRule, DebugAddr, DebugFrame, Dwarf, EhFrame, Expression,
    LocationLists, Range, RunTimeEndian, Section, UnitOffset, UnwindContext, UnwindSection,
    UnwindTableRow,
};
use log::{debug, info};
use object::{Object, ObjectSection};
use rayon::prelude::*;
use regex::Regex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Parsed DWARF image of a single executable object (program or shared library).
pub struct DebugInformation<R: gimli::Reader = EndianArcSlice> {
    file: PathBuf,
    inner: Dwarf<R>,
    eh_frame: EhFrame<R>,
    debug_frame: Option<DebugFrame<R>>,
    bases: BaseAddresses,
    units: Option<Vec<Unit>>,
    symbol_table: Option<SymbolTab>,
    build_id: Option<Vec<u8>>,
}

impl Clone for DebugInformation {
    fn clone(&self) -> Self {
        Self {
            file: self.file.clone(),
            inner: Dwarf {
                debug_abbrev: self.inner.debug_abbrev.clone(),
                debug_addr: self.inner.debug_addr.clone(),
                debug_aranges: self.inner.debug_aranges.clone(),
                debug_info: self.inner.debug_info.clone(),
                debug_line: self.inner.debug_line.clone(),
                debug_line_str: self.inner.debug_line_str.clone(),
                debug_str: self.inner.debug_str.clone(),
                debug_str_offsets: self.inner.debug_str_offsets.clone(),
                debug_types: self.inner.debug_types.clone(),
                locations: self.inner.locations.clone(),
                ranges: self.inner.ranges.clone(),
                file_type: self.inner.file_type,
                sup: self.inner.sup.clone(),
                abbreviations_cache: Default::default(),
            },
            eh_frame: self.eh_frame.clone(),
            debug_frame: self.debug_frame.clone(),
            bases: self.bases.clone(),
            units: self.units.clone(),
            symbol_table: self.symbol_table.clone(),
            build_id: self.build_id.clone(),
        }
    }
}

/// Using this macro means a promise that debug information exists in context of usage.
#[macro_export]
macro_rules! debug_info_exists {
    ($expr: expr) => {
        $expr.expect("unreachable: debug information must exists")
    };
}

impl DebugInformation {
    /// Return path to the file this debug information parsed from.
    pub fn pathname(&self) -> &Path {
        self.file.as_path()
    }

    /// Return the content-addressed build id of the image, if the dedicated note present.
    pub fn build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }

    /// True if underlying object file contains dwarf units.
    pub fn has_debug_info(&self) -> bool {
        self.units.is_some()
    }

    /// The location lists in the .debug_loc and .debug_loclists sections.
    pub fn locations(&self) -> &LocationLists<EndianArcSlice> {
        &self.inner.locations
    }

    pub fn debug_addr(&self) -> &DebugAddr<EndianArcSlice> {
        &self.inner.debug_addr
    }

    pub fn dwarf(&self) -> &Dwarf<EndianArcSlice> {
        &self.inner
    }

    /// Return all dwarf units or error if no debug information found.
    fn get_units(&self) -> Result<&[Unit], Error> {
        self.units
            .as_deref()
            .ok_or(Error::NoDebugInformation("object file"))
    }

    /// Return unit by its index.
    ///
    /// # Panics
    ///
    /// Panic if unit not found.
    pub fn unit_ensure(&self, idx: usize) -> &Unit {
        &debug_info_exists!(self.get_units())[idx]
    }

    /// Return unit count. Return 0 if no debug information exists.
    #[inline(always)]
    pub fn unit_count(&self) -> usize {
        self.units
            .as_ref()
            .map(|units| units.len())
            .unwrap_or_default()
    }

    pub(super) fn evaluate_cfa(
        &self,
        debugee: &Debugee,
        registers: &DwarfRegisterMap,
        utr: &UnwindTableRow<EndianArcSlice>,
        ctx: &ExplorationContext,
    ) -> Result<RelocatedAddress, Error> {
        let rule = utr.cfa();
        match rule {
            RegisterAndOffset { register, offset } => {
                let ra = registers.value(*register)?;
                Ok(RelocatedAddress::from(ra as usize).offset(*offset as isize))
            }
            CfaRule::Expression(expr) => {
                let unit = self
                    .find_unit_by_pc(ctx.location().global_pc)?
                    .ok_or(Error::UnitNotFound(ctx.location().global_pc))?;
                let evaluator = resolve_unit_call!(&self.inner, unit, evaluator, debugee);
                let expr_result = evaluator.evaluate(ctx, expr.clone())?;

                Ok((expr_result.into_scalar::<usize>(AddressKind::Value)?).into())
            }
        }
    }

    pub fn get_cfa(
        &self,
        debugee: &Debugee,
        expl_ctx: &ExplorationContext,
    ) -> Result<RelocatedAddress, Error> {
        let mut ctx = Box::new(UnwindContext::new());
        let row = self.eh_frame.unwind_info_for_address(
            &self.bases,
            &mut ctx,
            expl_ctx.location().global_pc.into(),
            EhFrame::cie_from_offset,
        )?;
        self.evaluate_cfa(
            debugee,
            &DwarfRegisterMap::from(
                RegisterMap::current(expl_ctx.pid_on_focus()).map_err(Error::Ptrace)?,
            ),
            row,
            expl_ctx,
        )
    }

    /// Return a list of all known files.
    pub fn known_files(&self) -> Result<impl Iterator<Item = &PathBuf>, Error> {
        Ok(self.get_units()?.iter().flat_map(|unit| unit.files().iter()))
    }

    /// Searches for a unit by occurrences of PC in its range.
    ///
    /// # Arguments
    ///
    /// * `pc`: program counter value
    ///
    /// returns: `None` if unit not found, error if no debug information found
    pub(super) fn find_unit_by_pc(&self, pc: GlobalAddress) -> Result<Option<&Unit>, Error> {
        Ok(self.get_units()?.iter().find(|&unit| {
            match unit
                .ranges()
                .binary_search_by_key(&(pc.into()), |r| r.begin)
            {
                Ok(_) => true,
                Err(pos) => unit.ranges()[..pos]
                    .iter()
                    .rev()
                    .any(|range| pc.in_range(range)),
            }
        }))
    }

    /// Returns best matched place by program counter global address.
    pub fn find_place_from_pc(
        &self,
        pc: GlobalAddress,
    ) -> Result<Option<unit::PlaceDescriptor>, Error> {
        let mb_unit = self.find_unit_by_pc(pc)?;
        Ok(mb_unit.and_then(|u| u.find_place_by_pc(pc)))
    }

    /// Returns place with line address equals to program counter global address.
    pub fn find_exact_place_from_pc(
        &self,
        pc: GlobalAddress,
    ) -> Result<Option<unit::PlaceDescriptor>, Error> {
        let mb_unit = self.find_unit_by_pc(pc)?;
        Ok(mb_unit.and_then(|u| u.find_exact_place_by_pc(pc)))
    }

    /// Return a function inside which the given instruction is located.
    ///
    /// # Arguments
    ///
    /// * `pc`: instruction global address.
    pub fn find_function_by_pc(
        &self,
        pc: GlobalAddress,
    ) -> Result<Option<ContextualDieRef<FunctionDie>>, Error> {
        let mb_unit = self.find_unit_by_pc(pc)?;
        Ok(mb_unit.and_then(|unit| {
            let pc = u64::from(pc);
            let die_ranges = resolve_unit_call!(self.dwarf(), unit, die_ranges);
            let find_pos = match die_ranges.binary_search_by_key(&pc, |dr| dr.range.begin) {
                Ok(pos) => {
                    let mut idx = pos + 1;
                    while idx < die_ranges.len() && die_ranges[idx].range.begin == pc {
                        idx += 1;
                    }
                    idx
                }
                Err(pos) => pos,
            };

            die_ranges[..find_pos].iter().rev().find_map(|dr| {
                let entry = resolve_unit_call!(&self.inner, unit, entry, dr.die_idx);
                if let DieVariant::Function(ref func) = entry.die {
                    if dr.range.begin <= pc && pc < dr.range.end {
                        return Some(ContextualDieRef {
                            debug_info: self,
                            node: &entry.node,
                            unit_idx: unit.idx(),
                            die: func,
                        });
                    }
                };
                None
            })
        }))
    }

    /// Return all functions matching a name needle (exact or package-suffix match).
    ///
    /// # Arguments
    ///
    /// * `needle`: function name.
    pub fn search_functions(
        &self,
        needle: &str,
    ) -> Result<Vec<ContextualDieRef<FunctionDie>>, Error> {
        let mut result = vec![];
        for unit in self.get_units()? {
            let entries = resolve_unit_call!(self.dwarf(), unit, search_functions, needle);
            for entry in entries {
                if let DieVariant::Function(ref func) = entry.die {
                    result.push(ContextualDieRef {
                        debug_info: self,
                        unit_idx: unit.idx(),
                        node: &entry.node,
                        die: func,
                    });
                }
            }
        }
        Ok(result)
    }

    /// Return all function names matching a regular expression.
    pub fn search_functions_by_regex(&self, regex: &Regex) -> Result<Vec<String>, Error> {
        let mut result = vec![];
        for unit in self.get_units()? {
            let entries_it = resolve_unit_call!(self.dwarf(), unit, entries_it);
            for entry in entries_it {
                if let DieVariant::Function(ref func) = entry.die {
                    if let Some(ref name) = func.base_attributes.name {
                        if regex.find(name).is_some() {
                            result.push(name.clone());
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// Return first found statement place for a file/line pair.
    pub fn find_place(&self, file: &str, line: u64) -> Result<Option<unit::PlaceDescriptor<'_>>, Error> {
        Ok(self
            .get_units()?
            .iter()
            .find_map(|unit| unit.find_stmt_line(file, line)))
    }

    /// Return place of a function prologue end, this is a better place for
    /// a user breakpoint than the function entry.
    pub fn get_function_place(&self, fn_name: &str) -> Result<PlaceDescriptorOwned, Error> {
        let mut functions = self.search_functions(fn_name)?;
        if functions.is_empty() {
            return Err(Error::SymbolNotFound(fn_name.to_string()));
        }
        if functions.len() > 1 {
            return Err(Error::AmbiguousSymbol(fn_name.to_string(), functions.len()));
        }
        let func = functions.pop().expect("infallible");
        Ok(func.prolog_end_place()?.to_owned())
    }

    pub fn find_symbols(&self, regex: &Regex) -> Vec<&Symbol> {
        self.symbol_table
            .as_ref()
            .map(|table| {
                let keys = table
                    .keys()
                    .filter(|key| regex.find(key.as_str()).is_some());
                keys.map(|k| &table[k]).collect()
            })
            .unwrap_or_default()
    }

    /// Find a single symbol by its exact name.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbol_table.as_ref().and_then(|table| table.get(name))
    }

    pub fn deref_die<'this>(
        &'this self,
        default_unit: &'this Unit,
        reference: DieRef,
    ) -> Option<(&'this Entry, &'this Unit)> {
        match reference {
            DieRef::Unit(offset) => {
                let entry = resolve_unit_call!(&self.inner, default_unit, find_entry, offset);
                entry.map(|e| (e, default_unit))
            }
            DieRef::Global(offset) => {
                let mb_unit = debug_info_exists!(self.get_units())
                    .binary_search_by_key(&Some(offset), |u| u.offset());
                let unit = match mb_unit {
                    Ok(idx) => self.unit_ensure(idx),
                    Err(0) => return None,
                    Err(pos) => self.unit_ensure(pos - 1),
                };
                let offset = UnitOffset(
                    offset.0
                        - unit
                            .offset()
                            .unwrap_or(gimli::DebugInfoOffset(0))
                            .0,
                );
                let entry = resolve_unit_call!(&self.inner, unit, find_entry, offset);
                entry.map(|e| (e, unit))
            }
        }
    }

    /// Find all variable dies with a given name visible at a location.
    pub fn find_variables(
        &self,
        location: Location,
        name: &str,
    ) -> Result<Vec<ContextualDieRef<'_, VariableDie>>, Error> {
        let units = self.get_units()?;

        let mut found = vec![];
        for unit in units {
            let mb_var_locations = resolve_unit_call!(self.dwarf(), unit, locate_var_die, name);
            if let Some(vars) = mb_var_locations {
                let vars = vars.to_vec();
                vars.into_iter().for_each(|entry_idx| {
                    let entry = resolve_unit_call!(&self.inner, unit, entry, entry_idx);
                    if let DieVariant::Variable(ref var) = entry.die {
                        let variable = ContextualDieRef {
                            debug_info: self,
                            unit_idx: unit.idx(),
                            node: &entry.node,
                            die: var,
                        };

                        if variable.valid_at(location.global_pc) {
                            found.push(variable);
                        }
                    }
                });
            }
        }

        Ok(found)
    }

    /// Find a type die by its name across all units.
    pub fn find_type_die_ref(&self, name: &str) -> Option<DieRef> {
        let units = self.get_units().ok()?;
        for unit in units {
            let offset = resolve_unit_call!(self.dwarf(), unit, locate_type, name);
            if let Some(offset) = offset {
                let unit_offset = unit.offset().unwrap_or(gimli::DebugInfoOffset(0));
                return Some(DieRef::Global(gimli::DebugInfoOffset(
                    unit_offset.0 + offset.0,
                )));
            }
        }
        None
    }

    /// Return all type names matching a regular expression.
    pub fn search_types_by_regex(&self, regex: &Regex) -> Result<Vec<String>, Error> {
        let mut result = vec![];
        for unit in self.get_units()? {
            let it = resolve_unit_call!(self.dwarf(), unit, type_iter);
            for (name, _) in it {
                if regex.find(name).is_some() {
                    result.push(name.clone());
                }
            }
        }
        result.sort_unstable();
        result.dedup();
        Ok(result)
    }

    /// Return the maximum and minimum address from the collection of unit ranges.
    pub fn range(&self) -> Option<Range> {
        let units = self.get_units().ok()?;

        // ranges already sorted by begin addr
        let begin = units
            .iter()
            .filter_map(|u| u.ranges().first().map(|r| r.begin))
            .min()?;

        let end = units
            .iter()
            .map(|u| {
                u.ranges().iter().fold(
                    begin,
                    |end, range| if range.end > end { range.end } else { end },
                )
            })
            .max()?;

        Some(Range { begin, end })
    }

    pub(super) fn eh_frame(&self) -> &EhFrame<EndianArcSlice> {
        &self.eh_frame
    }

    pub(super) fn debug_frame(&self) -> Option<&DebugFrame<EndianArcSlice>> {
        self.debug_frame.as_ref()
    }

    pub(super) fn bases(&self) -> &BaseAddresses {
        &self.bases
    }
}

/// Builder for [`DebugInformation`].
pub struct DebugInformationBuilder<'a> {
    debug_info_dirs: &'a [PathBuf],
}

impl<'a> DebugInformationBuilder<'a> {
    pub fn new(debug_info_dirs: &'a [PathBuf]) -> Self {
        Self { debug_info_dirs }
    }

    pub fn build(
        &self,
        obj_path: &Path,
        file: &object::File,
    ) -> Result<DebugInformation, Error> {
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let eh_frame = EhFrame::load(|id| -> gimli::Result<EndianArcSlice> {
            let data = file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[]));
            Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
        })?;

        let section_addr = |name: &str| -> Option<u64> {
            file.sections().find_map(|section| {
                if section.name().ok()? == name {
                    Some(section.address())
                } else {
                    None
                }
            })
        };
        let mut bases = BaseAddresses::default();
        if let Some(got) = section_addr(".got") {
            bases = bases.set_got(got);
        }
        if let Some(text) = section_addr(".text") {
            bases = bases.set_text(text);
        }
        if let Some(eh) = section_addr(".eh_frame") {
            bases = bases.set_eh_frame(eh);
        }
        if let Some(eh_frame_hdr) = section_addr(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(eh_frame_hdr);
        }

        let build_id = loader::build_id(file).ok();

        let debug_split_file_data;
        let debug_split_file;
        let debug_info_file = if let Some((path, debug_file)) =
            loader::find_separate_debug_file(obj_path, file, self.debug_info_dirs)
        {
            debug!(target: "dwarf-loader", "{obj_path:?} has separate debug information file");
            debug!(target: "dwarf-loader", "load debug information from {path:?}");
            debug_split_file_data = debug_file;
            debug_split_file = object::File::parse(&*debug_split_file_data)?;
            &debug_split_file
        } else {
            debug!(target: "dwarf-loader", "load debug information from {obj_path:?}");
            file
        };

        let dwarf = loader::load_par(debug_info_file, endian)?;
        let debug_frame = DebugFrame::load(|id| loader::load_section(id, debug_info_file, endian))
            .ok()
            .filter(|df: &DebugFrame<EndianArcSlice>| !df.reader().is_empty());
        let symbol_table = SymbolTab::new(debug_info_file);

        let parser = DwarfUnitParser::new(&dwarf);
        let headers = dwarf.units().collect::<Vec<_>>()?;

        if headers.is_empty() {
            // no units means no debug info
            info!(target: "dwarf-loader", "no debug information for {obj_path:?}");

            return Ok(DebugInformation {
                file: obj_path.to_path_buf(),
                inner: dwarf,
                eh_frame,
                debug_frame,
                bases,
                units: None,
                symbol_table,
                build_id,
            });
        }

        let mut units = headers
            .into_par_iter()
            .map(|header| -> gimli::Result<Unit> {
                let unit = parser.parse(header)?;
                Ok(unit)
            })
            .collect::<gimli::Result<Vec<_>>>()?;

        units.sort_unstable_by_key(|u| u.offset());
        units.iter_mut().enumerate().for_each(|(i, u)| u.set_idx(i));

        Ok(DebugInformation {
            file: obj_path.to_path_buf(),
            inner: dwarf,
            eh_frame,
            debug_frame,
            bases,
            units: Some(units),
            symbol_table,
            build_id,
        })
    }
}

/// A value (variable or parameter) allocated in the debugee memory.
pub trait AsAllocatedValue {
    fn name(&self) -> Option<&str>;

    fn type_ref(&self) -> Option<DieRef>;

    fn location(&self) -> Option<&Attribute<EndianArcSlice>>;

    fn location_expr(
        &self,
        dwarf_ctx: &DebugInformation<EndianArcSlice>,
        unit: &Unit,
        pc: GlobalAddress,
    ) -> Option<Expression<EndianArcSlice>> {
        let location = self.location()?;
        location::Location(location).try_as_expression(dwarf_ctx, unit, pc)
    }
}

impl AsAllocatedValue for VariableDie {
    fn name(&self) -> Option<&str> {
        self.base_attributes.name.as_deref()
    }

    fn type_ref(&self) -> Option<DieRef> {
        self.type_ref
    }

    fn location(&self) -> Option<&Attribute<EndianArcSlice>> {
        self.location.as_ref()
    }
}

impl AsAllocatedValue for ParameterDie {
    fn name(&self) -> Option<&str> {
        self.base_attributes.name.as_deref()
    }

    fn type_ref(&self) -> Option<DieRef> {
        self.type_ref
    }

    fn location(&self) -> Option<&Attribute<EndianArcSlice>> {
        self.location.as_ref()
    }
}

mod location {
    use super::{DebugInformation, EndianArcSlice};
    use crate::debugger::address::GlobalAddress;
    use crate::debugger::debugee::dwarf::unit::Unit;
    use crate::weak_error;
    use gimli::{Attribute, AttributeValue, Expression};

    /// DW_AT_location attribute, an expression or a location list offset.
    pub(super) struct Location<'a>(pub(super) &'a Attribute<EndianArcSlice>);

    impl<'a> Location<'a> {
        /// Materialize the location into a single expression valid at `pc`.
        pub fn try_as_expression(
            &self,
            dwarf_ctx: &DebugInformation<EndianArcSlice>,
            unit: &Unit,
            pc: GlobalAddress,
        ) -> Option<Expression<EndianArcSlice>> {
            match self.0.value() {
                AttributeValue::Exprloc(expr) => Some(expr),
                AttributeValue::LocationListsRef(offset) => {
                    let mut iter = weak_error!(dwarf_ctx.locations().locations(
                        offset,
                        unit.encoding(),
                        unit.low_pc(),
                        dwarf_ctx.debug_addr(),
                        unit.addr_base(),
                    ))?;
                    let pc = u64::from(pc);
                    while let Some(entry) = weak_error!(iter.next())? {
                        if entry.range.begin <= pc && pc < entry.range.end {
                            return Some(entry.data);
                        }
                    }
                    None
                }
                _ => None,
            }
        }
    }
}

/// Reference to a debug entry with the context (unit and debug information) it belongs to.
pub struct ContextualDieRef<'a, T> {
    pub debug_info: &'a DebugInformation,
    pub unit_idx: usize,
    pub node: &'a Node,
    pub die: &'a T,
}

#[macro_export]
macro_rules! ctx_resolve_unit_call {
    ($self: ident, $fn_name: tt, $($arg: expr),*) => {{
        $crate::resolve_unit_call!($self.debug_info.dwarf(), $self.unit(), $fn_name, $($arg),*)
    }};
}

impl<'a, T> Clone for ContextualDieRef<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for ContextualDieRef<'a, T> {}

impl<'a, T> ContextualDieRef<'a, T> {
    pub fn unit(&self) -> &'a Unit {
        self.debug_info.unit_ensure(self.unit_idx)
    }
}

impl<'ctx> ContextualDieRef<'ctx, FunctionDie> {
    /// Return the function name. Go function names in dwarf are fully qualified already.
    pub fn full_name(&self) -> Option<String> {
        self.die.base_attributes.name.clone()
    }

    pub fn frame_base_addr(
        &self,
        ctx: &ExplorationContext,
        debugee: &Debugee,
    ) -> Result<RelocatedAddress, Error> {
        let attr = self.die.fb_addr.as_ref().ok_or(Error::NoFBA)?;

        let expr = location::Location(attr)
            .try_as_expression(self.debug_info, self.unit(), ctx.location().global_pc)
            .ok_or(Error::FBANotAnExpression)?;

        let evaluator = ctx_resolve_unit_call!(self, evaluator, debugee);
        let result = evaluator
            .evaluate(ctx, expr)?
            .into_scalar::<usize>(AddressKind::Value)?;
        Ok(result.into())
    }

    pub fn local_variables(
        &self,
        pc: GlobalAddress,
    ) -> Vec<ContextualDieRef<'ctx, VariableDie>> {
        let mut result = vec![];
        let mut queue = VecDeque::from(self.node.children.clone());
        while let Some(idx) = queue.pop_front() {
            let entry = ctx_resolve_unit_call!(self, entry, idx);
            if let DieVariant::Variable(ref var) = entry.die {
                let var_ref = ContextualDieRef {
                    debug_info: self.debug_info,
                    unit_idx: self.unit_idx,
                    node: &entry.node,
                    die: var,
                };

                if var_ref.valid_at(pc) {
                    result.push(var_ref);
                }
            }
            entry.node.children.iter().for_each(|i| queue.push_back(*i));
        }
        result
    }

    pub fn parameters(&self) -> Vec<ContextualDieRef<'ctx, ParameterDie>> {
        let mut result = vec![];
        for &idx in &self.node.children {
            let entry = ctx_resolve_unit_call!(self, entry, idx);
            if let DieVariant::Parameter(ref var) = entry.die {
                result.push(ContextualDieRef {
                    debug_info: self.debug_info,
                    unit_idx: self.unit_idx,
                    node: &entry.node,
                    die: var,
                })
            }
        }
        result
    }

    pub fn prolog_start_place(&self) -> Result<unit::PlaceDescriptor<'ctx>, Error> {
        let low_pc = self
            .die
            .base_attributes
            .ranges
            .iter()
            .min_by(|r1, r2| r1.begin.cmp(&r2.begin))
            .ok_or_else(|| Error::NoFunctionRanges(self.full_name()))?
            .begin;

        debug_info_exists!(self
            .debug_info
            .find_place_from_pc(GlobalAddress::from(low_pc)))
        .ok_or(Error::PlaceNotFound(GlobalAddress::from(low_pc)))
    }

    pub fn prolog_end_place(&self) -> Result<unit::PlaceDescriptor<'ctx>, Error> {
        let mut place = self.prolog_start_place()?;
        while !place.prolog_end {
            match place.next() {
                None => break,
                Some(next_place) => place = next_place,
            }
        }

        Ok(place)
    }

    pub fn prolog(&self) -> Result<Range, Error> {
        let start = self.prolog_start_place()?;
        let end = self.prolog_end_place()?;
        Ok(Range {
            begin: start.address.into(),
            end: end.address.into(),
        })
    }

    pub fn ranges(&self) -> &[Range] {
        &self.die.base_attributes.ranges
    }

    pub fn inline_ranges(&self) -> Vec<Range> {
        let mut ranges = vec![];
        let mut queue = VecDeque::from(self.node.children.clone());
        while let Some(idx) = queue.pop_front() {
            let entry = ctx_resolve_unit_call!(self, entry, idx);
            if let DieVariant::InlineSubroutine(inline_subroutine) = &entry.die {
                ranges.extend(inline_subroutine.base_attributes.ranges.iter());
            }
            entry.node.children.iter().for_each(|i| queue.push_back(*i));
        }
        ranges
    }

    /// Return the chain of inlined calls active at `pc`, outermost first.
    pub fn inline_chain_at(
        &self,
        pc: GlobalAddress,
    ) -> Vec<ContextualDieRef<'ctx, InlineSubroutineDie>> {
        let mut chain = vec![];
        let mut queue: VecDeque<usize> = self.node.children.iter().copied().collect();

        while let Some(idx) = queue.pop_front() {
            let entry = ctx_resolve_unit_call!(self, entry, idx);
            match entry.die {
                DieVariant::InlineSubroutine(ref inlined) => {
                    if pc.in_ranges(&inlined.base_attributes.ranges) {
                        chain.push(ContextualDieRef {
                            debug_info: self.debug_info,
                            unit_idx: self.unit_idx,
                            node: &entry.node,
                            die: inlined,
                        });
                        // descend only into the matched inlined call
                        queue.clear();
                        queue.extend(entry.node.children.iter().copied());
                    }
                }
                DieVariant::LexicalBlock(ref lb) => {
                    // inlined subroutines may hide below lexical blocks
                    let block_ranges = &lb.base_attributes.ranges;
                    if block_ranges.is_empty() || pc.in_ranges(block_ranges) {
                        queue.extend(entry.node.children.iter().copied());
                    }
                }
                _ => {}
            }
        }

        chain
    }
}

impl<'ctx> ContextualDieRef<'ctx, InlineSubroutineDie> {
    /// Return the name of the inlined function from its abstract origin.
    pub fn inlined_name(&self) -> Option<String> {
        if let Some(name) = self.die.base_attributes.name.clone() {
            return Some(name);
        }
        let origin = self.die.abstract_origin?;
        let (entry, _) = self.debug_info.deref_die(self.unit(), origin)?;
        match entry.die {
            DieVariant::Function(ref func) => func.base_attributes.name.clone(),
            _ => None,
        }
    }

    /// Return the call site file and line of this inlined call.
    pub fn call_place(&self) -> Option<(PathBuf, u64)> {
        let file_idx = self.die.call_file? as usize;
        let file = self.unit().files().get(file_idx)?.clone();
        Some((file, self.die.call_line?))
    }
}

impl<'ctx> ContextualDieRef<'ctx, VariableDie> {
    pub fn valid_at(&self, pc: GlobalAddress) -> bool {
        self.die
            .lexical_block_idx
            .map(|lb_idx| {
                let entry = ctx_resolve_unit_call!(self, entry, lb_idx);
                let DieVariant::LexicalBlock(lb) = &entry.die else {
                    unreachable!();
                };

                lb.base_attributes.ranges.is_empty()
                    || lb.base_attributes.ranges.iter().any(|r| pc.in_range(r))
            })
            .unwrap_or(true)
    }

    pub fn assume_parent_function(&self) -> Option<ContextualDieRef<'ctx, FunctionDie>> {
        let mut mb_parent = self.node.parent;

        while let Some(p) = mb_parent {
            let entry = ctx_resolve_unit_call!(self, entry, p);
            if let DieVariant::Function(ref func) = entry.die {
                return Some(ContextualDieRef {
                    debug_info: self.debug_info,
                    unit_idx: self.unit_idx,
                    node: &entry.node,
                    die: func,
                });
            }

            mb_parent = entry.node.parent;
        }

        None
    }
}

impl<'ctx> ContextualDieRef<'ctx, ParameterDie> {
    /// Return the parent function of this parameter.
    pub fn parent_function(&self) -> Option<ContextualDieRef<'ctx, FunctionDie>> {
        let mut mb_parent = self.node.parent;

        while let Some(p) = mb_parent {
            let entry = ctx_resolve_unit_call!(self, entry, p);
            if let DieVariant::Function(ref func) = entry.die {
                return Some(ContextualDieRef {
                    debug_info: self.debug_info,
                    unit_idx: self.unit_idx,
                    node: &entry.node,
                    die: func,
                });
            }

            mb_parent = entry.node.parent;
        }

        None
    }
}

impl<'ctx, D: AsAllocatedValue> ContextualDieRef<'ctx, D> {
    pub fn r#type(&self) -> Option<ComplexType> {
        let parser = r#type::TypeParser::new();
        Some(parser.parse(*self, self.die.type_ref()?))
    }

    /// Read the raw value bytes of this variable from the tracee.
    pub fn read_value(
        &self,
        ctx: &ExplorationContext,
        debugee: &Debugee,
        r#type: &ComplexType,
    ) -> Option<Bytes> {
        self.die
            .location_expr(self.debug_info, self.unit(), ctx.location().global_pc)
            .and_then(|expr| {
                let evaluator = ctx_resolve_unit_call!(self, evaluator, debugee);
                let eval_result = weak_error!(evaluator.evaluate(ctx, expr))?;
                let type_size = r#type.type_size_in_bytes(
                    &r#type::EvaluationContext {
                        evaluator: &evaluator,
                        expl_ctx: ctx,
                    },
                    r#type.root(),
                )? as usize;
                weak_error!(eval_result.into_raw_buffer(type_size, AddressKind::MemoryAddress))
            })
    }

    /// Evaluate the address of this variable in tracee memory, if addressable.
    pub fn address(
        &self,
        ctx: &ExplorationContext,
        debugee: &Debugee,
    ) -> Option<RelocatedAddress> {
        self.die
            .location_expr(self.debug_info, self.unit(), ctx.location().global_pc)
            .and_then(|expr| {
                let evaluator = ctx_resolve_unit_call!(self, evaluator, debugee);
                let eval_result = weak_error!(evaluator.evaluate(ctx, expr))?;
                let addr =
                    weak_error!(eval_result.into_scalar::<usize>(AddressKind::MemoryAddress))?;
                Some(RelocatedAddress::from(addr))
            })
    }
}
