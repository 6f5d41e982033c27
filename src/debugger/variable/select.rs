use crate::debugger::debugee::dwarf::unit::{ParameterDie, VariableDie};
use crate::debugger::debugee::dwarf::{AsAllocatedValue, ContextualDieRef};
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use crate::debugger::ExplorationContext;
use gimli::Range;

/// A named entity resolved in a scope: local variable or formal parameter.
pub enum ResolvedVar<'a> {
    Variable(ContextualDieRef<'a, VariableDie>),
    Parameter(ContextualDieRef<'a, ParameterDie>),
}

impl<'a> ResolvedVar<'a> {
    pub fn name(&self) -> Option<&str> {
        match self {
            ResolvedVar::Variable(v) => v.die.name(),
            ResolvedVar::Parameter(p) => p.die.name(),
        }
    }

    /// Address ranges where the resolved entity is alive: the lexical block of a
    /// local, the whole function of a parameter, `None` for globals.
    pub fn scope_ranges(&self) -> Option<Vec<Range>> {
        match self {
            ResolvedVar::Variable(var) => {
                let fn_ranges = var
                    .assume_parent_function()
                    .map(|f| f.ranges().to_vec())?;
                Some(fn_ranges)
            }
            ResolvedVar::Parameter(param) => {
                Some(param.parent_function()?.ranges().to_vec())
            }
        }
    }
}

/// Resolve an identifier against a scope.
///
/// Search order: local variables of the frame (dwarf lexical blocks honored, an inner
/// declaration shadows an outer one), formal parameters (a method receiver is the
/// first parameter), package level variables of the compilation unit in focus, then
/// package level variables of any loaded unit by qualified name.
pub fn resolve_identifier<'a>(
    debugee: &'a Debugee,
    ctx: &ExplorationContext,
    name: &str,
    local_only: bool,
) -> Result<Vec<ResolvedVar<'a>>, Error> {
    let pc = ctx.location().pc;
    let global_pc = ctx.location().global_pc;
    let debug_info = debugee.debug_info(pc)?;

    let current_fn = debug_info.find_function_by_pc(global_pc)?;

    // frame locals, innermost declaration wins
    if let Some(func) = current_fn {
        let mut locals: Vec<_> = func
            .local_variables(global_pc)
            .into_iter()
            .filter(|var| var.die.name() == Some(name))
            .collect();
        if !locals.is_empty() {
            // deeper lexical blocks are parsed after their parents,
            // a greater block index means a more nested declaration
            locals.sort_by_key(|var| var.die.lexical_block_idx.unwrap_or(0));
            let innermost = locals.pop().expect("infallible");
            return Ok(vec![ResolvedVar::Variable(innermost)]);
        }

        let params: Vec<_> = func
            .parameters()
            .into_iter()
            .filter(|p| p.die.name() == Some(name))
            .map(ResolvedVar::Parameter)
            .collect();
        if !params.is_empty() {
            return Ok(params);
        }
    }

    if local_only {
        return Ok(vec![]);
    }

    // package level variables, short names expanded with the package of the
    // function in focus
    let mut candidates = vec![name.to_string()];
    if let Some(package) = current_fn
        .and_then(|f| f.full_name())
        .and_then(|full| full.rsplit_once('.').map(|(pkg, _)| pkg.to_string()))
    {
        if !name.contains('.') {
            candidates.push(format!("{package}.{name}"));
        }
    }

    let mut result = vec![];
    for debug_info in debugee.debug_info_all() {
        if !debug_info.has_debug_info() {
            continue;
        }
        for candidate in &candidates {
            let vars = debug_info.find_variables(ctx.location(), candidate)?;
            result.extend(vars.into_iter().map(ResolvedVar::Variable));
        }
        if !result.is_empty() {
            break;
        }
    }

    Ok(result)
}

/// Resolve all visible local variables of the frame in focus.
pub fn resolve_all_locals<'a>(
    debugee: &'a Debugee,
    ctx: &ExplorationContext,
) -> Result<Vec<ResolvedVar<'a>>, Error> {
    let debug_info = debugee.debug_info(ctx.location().pc)?;
    let Some(func) = debug_info.find_function_by_pc(ctx.location().global_pc)? else {
        return Ok(vec![]);
    };

    Ok(func
        .local_variables(ctx.location().global_pc)
        .into_iter()
        .map(ResolvedVar::Variable)
        .collect())
}

/// Resolve all formal parameters of the function in focus.
pub fn resolve_all_params<'a>(
    debugee: &'a Debugee,
    ctx: &ExplorationContext,
) -> Result<Vec<ResolvedVar<'a>>, Error> {
    let debug_info = debugee.debug_info(ctx.location().pc)?;
    let Some(func) = debug_info.find_function_by_pc(ctx.location().global_pc)? else {
        return Ok(vec![]);
    };

    Ok(func
        .parameters()
        .into_iter()
        .map(ResolvedVar::Parameter)
        .collect())
}

/// Resolve package level variables matching a regex filter, `None` filter means all.
pub fn resolve_package_vars<'a>(
    debugee: &'a Debugee,
    filter: Option<&regex::Regex>,
) -> Result<Vec<ResolvedVar<'a>>, Error> {
    use crate::debugger::debugee::dwarf::unit::DieVariant;
    use crate::resolve_unit_call;

    let mut result = vec![];
    for debug_info in debugee.debug_info_all() {
        if !debug_info.has_debug_info() {
            continue;
        }

        for unit_idx in 0..debug_info.unit_count() {
            let unit = debug_info.unit_ensure(unit_idx);
            let entries_it = resolve_unit_call!(debug_info.dwarf(), unit, entries_it);
            for entry in entries_it {
                let DieVariant::Variable(ref var) = entry.die else {
                    continue;
                };
                // package level variables live outside any function
                if var.fn_block_idx.is_some() {
                    continue;
                }
                let Some(name) = var.base_attributes.name.as_deref() else {
                    continue;
                };
                if let Some(filter) = filter {
                    if filter.find(name).is_none() {
                        continue;
                    }
                }
                result.push(ResolvedVar::Variable(ContextualDieRef {
                    debug_info,
                    unit_idx,
                    node: &entry.node,
                    die: var,
                }));
            }
        }
    }
    Ok(result)
}
