use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::{DebugInformation, EndianArcSlice};
use crate::debugger::error::Error;
use nix::unistd::Pid;
use proc_maps::MapRange;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct TextRange {
    from: RelocatedAddress,
    to: RelocatedAddress,
}

/// Source path substitution rule: `from` prefix replaced with `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutionRule {
    pub from: PathBuf,
    pub to: PathBuf,
}

impl SubstitutionRule {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    fn try_apply(&self, path: &Path) -> Option<PathBuf> {
        let tail = path.strip_prefix(&self.from).ok()?;
        Some(self.to.join(tail))
    }
}

/// Information about a single mapped region owned by an executable object.
#[derive(Debug, Clone)]
pub struct RegionInfo {
    pub path: PathBuf,
    pub offset: Option<usize>,
    pub has_debug_info: bool,
}

/// Registry contains debug information about main executable object and loaded shared libraries.
pub struct DwarfRegistry {
    /// process pid
    pid: Pid,
    /// main executable file
    program_path: PathBuf,
    /// debug information map
    files: HashMap<PathBuf, DebugInformation>,
    /// ordered .text section address ranges, calculates by dwarf units ranges
    ranges: Vec<(PathBuf, TextRange)>,
    /// regions map addresses, each region is a shared lib or debugee program
    mappings: HashMap<PathBuf, usize>,
    /// source path substitution rules
    substitutions: Vec<SubstitutionRule>,
}

impl DwarfRegistry {
    /// Create new registry.
    ///
    /// # Arguments
    ///
    /// * `pid`: program process pid
    /// * `program_path`: path to program executable
    /// * `program_dwarf`: program dwarf information
    pub fn new(
        pid: Pid,
        program_path: PathBuf,
        program_dwarf: DebugInformation<EndianArcSlice>,
    ) -> Self {
        Self {
            pid,
            program_path: program_path.clone(),
            files: HashMap::from([(program_path, program_dwarf)]),
            ranges: vec![],
            mappings: HashMap::new(),
            substitutions: vec![],
        }
    }

    /// Update ranges with respect of VAS segments addresses.
    /// Must be called after program is loaded into memory.
    ///
    /// # Arguments
    ///
    /// * `only_main`: if true - update mappings only for main executable file, false - update all
    pub fn update_mappings(&mut self, only_main: bool) -> Result<Vec<Error>, Error> {
        let proc_maps: Vec<MapRange> =
            proc_maps::get_process_maps(self.pid.as_raw()).map_err(Error::IO)?;

        let mut mappings = HashMap::with_capacity(self.files.len());
        let mut ranges = vec![];
        let mut errors = Vec::new();

        let (mut full_it, mut only_main_it);
        let iter: &mut dyn Iterator<Item = (&PathBuf, &DebugInformation)> = if only_main {
            only_main_it = self
                .files
                .iter()
                .filter(|(file, _)| *file == &self.program_path);
            &mut only_main_it
        } else {
            full_it = self.files.iter();
            &mut full_it
        };

        iter.for_each(|(file, dwarf)| {
            let Ok(absolute_debugee_path) = file.canonicalize() else {
                errors.push(Error::MappingNotFound(file.to_string_lossy().to_string()));
                return;
            };
            let maps = proc_maps
                .iter()
                .filter(|map| map.filename() == Some(absolute_debugee_path.as_path()))
                .collect::<Vec<_>>();

            if maps.is_empty() {
                errors.push(Error::MappingNotFound(file.to_string_lossy().to_string()));
                return;
            }

            let lower_sect = maps
                .iter()
                .min_by(|map1, map2| map1.start().cmp(&map2.start()))
                .expect("at least one mapping must exists");
            let higher_sect = maps
                .iter()
                .max_by(|map1, map2| map1.start().cmp(&map2.start()))
                .expect("at least one mapping must exists");

            // go binaries are typically linked with a fixed image base, a mapping
            // below the dwarf range means a non-PIE layout with zero offset
            let mut mapping = lower_sect.start();
            let range = dwarf.range();
            if let Some(ref range) = range {
                if (range.begin as usize) >= lower_sect.start() {
                    mapping = 0;
                }
            }

            let range = match range {
                None => TextRange {
                    from: RelocatedAddress::from(lower_sect.start()),
                    to: RelocatedAddress::from(higher_sect.start() + higher_sect.size()),
                },
                Some(range) => TextRange {
                    from: RelocatedAddress::from(range.begin as usize + mapping),
                    to: RelocatedAddress::from(range.end as usize + mapping),
                },
            };

            mappings.insert(file.clone(), mapping);
            ranges.push((file.clone(), range));
        });

        self.mappings = mappings;
        ranges.sort_unstable_by(|(_, r1), (_, r2)| r1.from.cmp(&r2.from));
        self.ranges = ranges;

        Ok(errors)
    }

    /// Return shared objects currently mapped into the process, ordered by base address.
    pub fn discover_shared_objects(&self) -> Result<Vec<PathBuf>, Error> {
        let proc_maps = proc_maps::get_process_maps(self.pid.as_raw()).map_err(Error::IO)?;
        let mut seen = vec![];
        for map in proc_maps {
            let Some(file) = map.filename() else {
                continue;
            };
            let fname = file.to_string_lossy();
            if !fname.contains(".so") || fname.contains("vdso") {
                continue;
            }
            if !seen.contains(&file.to_path_buf()) {
                seen.push(file.to_path_buf());
            }
        }
        Ok(seen)
    }

    /// Add new debug information into registry.
    ///
    /// # Arguments
    ///
    /// * `file`: path to executable object or shared lib
    /// * `dwarf`: parsed dwarf information
    pub fn add(&mut self, file: &Path, dwarf: DebugInformation<EndianArcSlice>) -> Result<(), Error> {
        // validate path
        file.canonicalize()?;
        self.files.insert(file.to_path_buf(), dwarf);
        Ok(())
    }

    /// Remove debug information of an unloaded object.
    pub fn remove(&mut self, file: &Path) {
        self.files.remove(file);
        self.ranges.retain(|(path, _)| path != file);
        self.mappings.remove(file);
    }

    /// Return all known debug information. Debug info about main executable object
    /// is located at the zero index.
    pub fn all_dwarf(&self) -> Vec<&DebugInformation> {
        let mut dwarfs: Vec<_> = self.files.values().collect();
        dwarfs.sort_unstable_by(|d1, d2| {
            if d1.pathname() == self.program_path {
                return Ordering::Less;
            };
            d1.pathname().cmp(d2.pathname())
        });
        dwarfs
    }

    fn find_range(&self, addr: RelocatedAddress) -> Option<&(PathBuf, TextRange)> {
        self.ranges
            .binary_search_by(|(_, range)| {
                if addr >= range.from && addr <= range.to {
                    Ordering::Equal
                } else if range.from > addr {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            })
            .ok()
            .map(|idx| &self.ranges[idx])
    }

    /// Return debug information that describes .text section determined by given address.
    ///
    /// # Arguments
    ///
    /// * `addr`: memory address that determine .text section.
    pub fn find_by_addr(&self, addr: RelocatedAddress) -> Option<&DebugInformation> {
        let (path, _) = self.find_range(addr)?;
        self.files.get(path)
    }

    /// Return debug information parsed from the given file.
    pub fn find_by_file(&self, file: &Path) -> Option<&DebugInformation> {
        self.files.get(file)
    }

    /// Calculate virtual memory region to which the address belongs and return
    /// this region offset.
    ///
    /// # Arguments
    ///
    /// * `addr`: address for determine VAS region.
    pub fn find_mapping_offset(&self, addr: RelocatedAddress) -> Option<usize> {
        let (path, _) = self.find_range(addr)?;
        self.mappings.get(path).copied()
    }

    /// Return offset of mapped memory region.
    ///
    /// # Arguments
    ///
    /// * `dwarf`: debug information for determine memory region.
    pub fn find_mapping_offset_for_file(&self, dwarf: &DebugInformation) -> Option<usize> {
        self.mappings.get(dwarf.pathname()).copied()
    }

    /// Find main executable object debug information.
    pub fn find_main_program_dwarf(&self) -> Option<&DebugInformation> {
        self.files.get(&self.program_path)
    }

    /// Return an ordered list of known regions (main executable region at first place).
    pub fn dump(&self) -> Vec<RegionInfo> {
        self.all_dwarf()
            .into_iter()
            .map(|dwarf| RegionInfo {
                path: dwarf.pathname().to_path_buf(),
                offset: self.mappings.get(dwarf.pathname()).copied(),
                has_debug_info: dwarf.has_debug_info(),
            })
            .collect()
    }

    /// Create new [`DwarfRegistry`] with same dwarf info.
    ///
    /// # Arguments
    ///
    /// * `new_pid`: new process pid
    pub fn extend(&self, new_pid: Pid) -> Self {
        Self {
            pid: new_pid,
            program_path: self.program_path.clone(),
            files: self.files.clone(),
            // mappings and ranges must be redefined
            ranges: vec![],
            mappings: HashMap::default(),
            substitutions: self.substitutions.clone(),
        }
    }

    // ---------------------------------- path substitution ----------------------------------------

    pub fn add_substitution_rule(&mut self, rule: SubstitutionRule) {
        self.substitutions.push(rule);
    }

    pub fn substitution_rules(&self) -> &[SubstitutionRule] {
        &self.substitutions
    }

    /// Rewrite a source path read from dwarf through the substitution rules.
    /// The first matching rule wins, a path without matches returned unchanged.
    pub fn apply_substitutions(&self, path: &Path) -> PathBuf {
        self.substitutions
            .iter()
            .find_map(|rule| rule.try_apply(path))
            .unwrap_or_else(|| path.to_path_buf())
    }
}

/// Minimal observation count for a guessed substitution rule.
const GUESS_MIN_OBSERVATIONS: usize = 10;
/// Minimal share of observations that must agree on a common prefix.
const GUESS_AGREEMENT: f64 = 0.8;

/// Guess substitution rules from observed source paths.
///
/// For every client hint (module name, local directory) collect the directory prefixes
/// under which the module occurs in the observed paths. A rule is produced only when a
/// single prefix accumulates enough observations and the vast majority agrees on it.
///
/// # Arguments
///
/// * `observations`: source file paths observed in function debug entries
/// * `hints`: client-supplied module name to local directory pairs
pub fn guess_substitution_rules(
    observations: &[PathBuf],
    hints: &[(String, PathBuf)],
) -> Vec<SubstitutionRule> {
    let mut rules = vec![];

    for (module, local_dir) in hints {
        let mut prefixes: HashMap<PathBuf, usize> = HashMap::new();
        let mut total = 0_usize;

        for path in observations {
            let mut prefix = PathBuf::new();
            let mut found = None;
            for component in path.components() {
                prefix.push(component);
                if component.as_os_str().to_string_lossy() == module.as_str() {
                    found = Some(prefix.clone());
                    break;
                }
            }

            if let Some(prefix) = found {
                total += 1;
                *prefixes.entry(prefix).or_default() += 1;
            }
        }

        if total < GUESS_MIN_OBSERVATIONS {
            continue;
        }

        let Some((best_prefix, best_count)) = prefixes.into_iter().max_by_key(|(_, cnt)| *cnt)
        else {
            continue;
        };

        if (best_count as f64) / (total as f64) >= GUESS_AGREEMENT {
            rules.push(SubstitutionRule::new(best_prefix, local_dir.clone()));
        }
    }

    rules
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_substitution_rule_apply() {
        let rule = SubstitutionRule::new("/build/src/app", "/home/user/app");
        assert_eq!(
            rule.try_apply(Path::new("/build/src/app/pkg/main.go")),
            Some(PathBuf::from("/home/user/app/pkg/main.go"))
        );
        assert_eq!(rule.try_apply(Path::new("/other/app/main.go")), None);
    }

    #[test]
    fn test_guess_substitution_rules() {
        let mut observations: Vec<PathBuf> = (0..15)
            .map(|i| PathBuf::from(format!("/ci/builder/myapp/pkg/file{i}.go")))
            .collect();
        // a couple of odd paths should not break the agreement
        observations.push(PathBuf::from("/tmp/myapp/other.go"));

        let hints = vec![("myapp".to_string(), PathBuf::from("/home/op/myapp"))];
        let rules = guess_substitution_rules(&observations, &hints);

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].from, PathBuf::from("/ci/builder/myapp"));
        assert_eq!(rules[0].to, PathBuf::from("/home/op/myapp"));
    }

    #[test]
    fn test_guess_needs_enough_observations() {
        let observations: Vec<PathBuf> = (0..5)
            .map(|i| PathBuf::from(format!("/ci/myapp/file{i}.go")))
            .collect();
        let hints = vec![("myapp".to_string(), PathBuf::from("/home/op/myapp"))];
        assert!(guess_substitution_rules(&observations, &hints).is_empty());
    }

    #[test]
    fn test_guess_needs_agreement() {
        let mut observations: Vec<PathBuf> = (0..8)
            .map(|i| PathBuf::from(format!("/ci/a/myapp/file{i}.go")))
            .collect();
        observations.extend((0..7).map(|i| PathBuf::from(format!("/ci/b/myapp/file{i}.go"))));

        let hints = vec![("myapp".to_string(), PathBuf::from("/home/op/myapp"))];
        // 8/15 agreement is below the threshold
        assert!(guess_substitution_rules(&observations, &hints).is_empty());
    }
}
