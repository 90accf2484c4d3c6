//! Enumerate the import address tables of every module in a process.
//!
//! The walk happens entirely through remote reads: for each module the PE
//! headers are parsed out of target memory, then the import descriptor
//! table and its thunk arrays are followed slot by slot. Collected records
//! answer "where is `kernel32!WriteFile` bound in this process" style
//! queries without ever mapping the module locally.

use core::mem;

use log::warn;

use winapi::shared::minwindef::{HMODULE, MAX_PATH};
use winapi::um::psapi::{EnumProcessModulesEx, GetModuleFileNameExA, LIST_MODULES_ALL};
use winapi::um::winnt::{PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

use crate::common::{Address, RawHandle};
use crate::debugger::memory;
use crate::error::{last_os_error, Error};
use crate::handle::Handle;

/// An `IMAGE_IMPORT_DESCRIPTOR` as it sits in the mapped image.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct ImportDescriptor {
    original_first_thunk: u32,
    time_date_stamp: u32,
    forwarder_chain: u32,
    name: u32,
    first_thunk: u32,
}

/// One resolved import slot.
#[derive(Debug, Clone)]
pub struct IatRecord {
    /// Full path of the importing module.
    pub module_path: String,
    /// Base address of the importing module.
    pub module_base: Address,
    /// Name of the DLL the import comes from.
    pub dll_name: String,
    /// Whether the import is by ordinal rather than by name.
    pub by_ordinal: bool,
    /// The ordinal, when `by_ordinal` is set.
    pub ordinal: u16,
    /// The imported function name, when imported by name.
    pub func_name: String,
    /// Virtual address of the IAT slot itself.
    pub iat_slot: Address,
    /// The resolved target the slot currently points at.
    pub target: Address,
    /// Base of the thunk array the slot belongs to.
    pub iat_base: Address,
    /// Index of the slot within its thunk array.
    pub index: usize,
}

/// A module seen during collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Full path of the module.
    pub path: String,
    /// Base address of the module.
    pub base: Address,
}

/// Where an import is bound: the slot's own address and its current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionAddress {
    /// Virtual address of the IAT slot.
    pub iat_slot: Address,
    /// The address the slot points at.
    pub target: Address,
}

/// Walks and queries a process' import address tables.
pub struct Imports {
    process: Handle,
    entries: Vec<IatRecord>,
}

fn base_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

fn dll_equals(a: &str, b: &str) -> bool {
    base_name(a).eq_ignore_ascii_case(base_name(b))
}

fn func_matches(record: &IatRecord, func: &str) -> bool {
    if let Some(ordinal) = func.strip_prefix('#') {
        return record.by_ordinal && ordinal.parse::<u16>().map_or(false, |o| o == record.ordinal);
    }
    !record.by_ordinal && record.func_name.eq_ignore_ascii_case(func)
}

impl Imports {
    /// Build an inspector over the process behind `process`.
    ///
    /// The handle is duplicated with query and read access; the original
    /// stays untouched and unowned.
    pub fn new(process: RawHandle) -> Result<Imports, Error> {
        let process = Handle::duplicate(process, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ)?;
        Ok(Imports {
            process,
            entries: Vec::new(),
        })
    }

    /// Discard previous results and walk every module's import table.
    ///
    /// Modules whose headers cannot be read are skipped with a warning;
    /// the walk itself only fails when the module list cannot be
    /// enumerated at all.
    pub fn collect(&mut self) -> Result<(), Error> {
        self.entries.clear();

        let mut modules = [0 as HMODULE; 1024];
        let mut needed = 0u32;
        let ok = unsafe {
            EnumProcessModulesEx(
                self.process.raw(),
                modules.as_mut_ptr(),
                mem::size_of_val(&modules) as u32,
                &mut needed,
                LIST_MODULES_ALL,
            )
        };
        if ok == 0 {
            return Err(last_os_error("EnumProcessModulesEx"));
        }

        let count = (needed as usize / mem::size_of::<HMODULE>()).min(modules.len());
        for &module in &modules[..count] {
            let mut path_buf = [0u8; MAX_PATH];
            let len = unsafe {
                GetModuleFileNameExA(
                    self.process.raw(),
                    module,
                    path_buf.as_mut_ptr() as *mut i8,
                    MAX_PATH as u32,
                )
            } as usize;
            let path = String::from_utf8_lossy(&path_buf[..len]).into_owned();

            if let Err(err) = self.collect_module(module as Address, &path) {
                warn!("skipping import table of {}: {}", path, err);
            }
        }
        Ok(())
    }

    /// The records gathered by the last [`Imports::collect`].
    pub fn entries(&self) -> &[IatRecord] {
        &self.entries
    }

    /// The one slot binding `dll!func` inside the module named `module`.
    ///
    /// `None` when there is no match, or more than one.
    pub fn find_import(&self, module: &str, dll: &str, func: &str) -> Option<FunctionAddress> {
        let mut hit = None;
        for record in &self.entries {
            if !dll_equals(&record.module_path, module)
                || !dll_equals(&record.dll_name, dll)
                || !func_matches(record, func)
            {
                continue;
            }
            if hit.is_some() {
                return None;
            }
            hit = Some(FunctionAddress {
                iat_slot: record.iat_slot,
                target: record.target,
            });
        }
        hit
    }

    /// Every slot binding `dll!func`, across all modules. `func` may be
    /// `"#123"` to select an ordinal import.
    pub fn find_imports(&self, dll: &str, func: &str) -> Vec<FunctionAddress> {
        self.entries
            .iter()
            .filter(|r| dll_equals(&r.dll_name, dll) && func_matches(r, func))
            .map(|r| FunctionAddress {
                iat_slot: r.iat_slot,
                target: r.target,
            })
            .collect()
    }

    /// Every slot binding `dll!func` inside the module based at
    /// `module_base`.
    pub fn find_imports_in_module(
        &self,
        module_base: Address,
        dll: &str,
        func: &str,
    ) -> Vec<FunctionAddress> {
        self.entries
            .iter()
            .filter(|r| {
                r.module_base == module_base
                    && dll_equals(&r.dll_name, dll)
                    && func_matches(r, func)
            })
            .map(|r| FunctionAddress {
                iat_slot: r.iat_slot,
                target: r.target,
            })
            .collect()
    }

    /// Every slot importing anything from `dll`.
    pub fn find_imports_by_dll(&self, dll: &str) -> Vec<FunctionAddress> {
        self.entries
            .iter()
            .filter(|r| dll_equals(&r.dll_name, dll))
            .map(|r| FunctionAddress {
                iat_slot: r.iat_slot,
                target: r.target,
            })
            .collect()
    }

    /// Every slot importing `func`, from any DLL.
    pub fn find_imports_by_name(&self, func: &str) -> Vec<FunctionAddress> {
        self.entries
            .iter()
            .filter(|r| func_matches(r, func))
            .map(|r| FunctionAddress {
                iat_slot: r.iat_slot,
                target: r.target,
            })
            .collect()
    }

    /// The distinct modules seen during collection, ordered by base.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut out: Vec<ModuleInfo> = Vec::new();
        for record in &self.entries {
            if out.iter().all(|m| m.base != record.module_base) {
                out.push(ModuleInfo {
                    path: record.module_path.clone(),
                    base: record.module_base,
                });
            }
        }
        out.sort_by_key(|m| m.base);
        out
    }

    fn collect_module(&mut self, base: Address, path: &str) -> Result<(), Error> {
        let process = self.process.raw();

        let mut header_page = vec![0u8; 0x1000];
        memory::read(process, base, &mut header_page)?;
        let header =
            goblin::pe::header::Header::parse(&header_page).map_err(|_| Error::BadImage(base))?;
        let optional = header.optional_header.ok_or(Error::BadImage(base))?;

        let is64 = optional.standard_fields.magic == goblin::pe::optional_header::MAGIC_64;
        let size_of_image = optional.windows_fields.size_of_image as usize;
        let import_dir = match optional.data_directories.get_import_table() {
            Some(dir) if dir.virtual_address != 0 && dir.size != 0 => *dir,
            _ => return Ok(()),
        };

        let pointer_size = if is64 { 8 } else { 4 };
        let ordinal_flag: u64 = if is64 { 1 << 63 } else { 1 << 31 };
        let descriptors = base + import_dir.virtual_address as usize;

        for desc_index in 0.. {
            let desc_addr = descriptors + desc_index * mem::size_of::<ImportDescriptor>();
            let desc: ImportDescriptor = memory::read_value(process, desc_addr).unwrap_or_default();
            if desc.name == 0 && desc.first_thunk == 0 && desc.original_first_thunk == 0 {
                break;
            }

            let dll_name = if desc.name != 0 {
                let name_va = base + desc.name as usize;
                self.read_c_string(name_va, span_left(base, name_va, size_of_image))
            } else {
                "<no-name>".to_owned()
            };

            // Unbound tables carry only the first-thunk array.
            let lookup_rva = if desc.original_first_thunk != 0 {
                desc.original_first_thunk
            } else {
                desc.first_thunk
            };
            if lookup_rva as usize >= size_of_image || desc.first_thunk as usize >= size_of_image {
                continue;
            }

            let lookup = base + lookup_rva as usize;
            let iat_base = base + desc.first_thunk as usize;

            for index in 0.. {
                let thunk = self.read_thunk(lookup + index * pointer_size, is64);
                if thunk == 0 {
                    break;
                }

                let iat_slot = iat_base + index * pointer_size;
                let target = self.read_thunk(iat_slot, is64);

                let mut record = IatRecord {
                    module_path: path.to_owned(),
                    module_base: base,
                    dll_name: dll_name.clone(),
                    by_ordinal: false,
                    ordinal: 0,
                    func_name: String::new(),
                    iat_slot,
                    target: target as Address,
                    iat_base,
                    index,
                };

                if thunk & ordinal_flag != 0 {
                    record.by_ordinal = true;
                    record.ordinal = (thunk & 0xFFFF) as u16;
                } else {
                    // IMAGE_IMPORT_BY_NAME: a WORD hint, then the name.
                    let name_va = base + (thunk & !ordinal_flag) as usize + 2;
                    let name =
                        self.read_c_string(name_va, span_left(base, name_va, size_of_image));
                    record.func_name = if name.is_empty() {
                        "<name-read-failed>".to_owned()
                    } else {
                        name
                    };
                }

                self.entries.push(record);
            }
        }

        Ok(())
    }

    fn read_thunk(&self, address: Address, is64: bool) -> u64 {
        let process = self.process.raw();
        if is64 {
            memory::read_value::<u64>(process, address).unwrap_or(0)
        } else {
            memory::read_value::<u32>(process, address).unwrap_or(0) as u64
        }
    }

    /// Read a NUL-terminated string out of the target in small chunks,
    /// bounded by `max_len`.
    fn read_c_string(&self, address: Address, max_len: usize) -> String {
        let process = self.process.raw();
        let mut out = Vec::new();
        let mut offset = 0;

        while offset < max_len {
            let mut chunk = [0u8; 256];
            let to_read = chunk.len().min(max_len - offset);
            if memory::read(process, address + offset, &mut chunk[..to_read]).is_err() {
                break;
            }
            match chunk[..to_read].iter().position(|&b| b == 0) {
                Some(nul) => {
                    out.extend_from_slice(&chunk[..nul]);
                    return String::from_utf8_lossy(&out).into_owned();
                }
                None => out.extend_from_slice(&chunk[..to_read]),
            }
            offset += to_read;
        }

        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Bytes remaining from `va` to the end of the module mapped at `base`.
fn span_left(base: Address, va: Address, size_of_image: usize) -> usize {
    if va < base {
        return 0;
    }
    let offset = va - base;
    size_of_image.saturating_sub(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(module: &str, dll: &str, func: &str) -> IatRecord {
        IatRecord {
            module_path: module.to_owned(),
            module_base: 0x40_0000,
            dll_name: dll.to_owned(),
            by_ordinal: false,
            ordinal: 0,
            func_name: func.to_owned(),
            iat_slot: 0x40_2000,
            target: 0x7ff0_0000,
            iat_base: 0x40_2000,
            index: 0,
        }
    }

    #[test]
    fn dll_names_compare_by_basename_case_insensitively() {
        assert!(dll_equals("C:\\Windows\\System32\\KERNEL32.DLL", "kernel32.dll"));
        assert!(!dll_equals("kernel32.dll", "ntdll.dll"));
    }

    #[test]
    fn ordinal_syntax_selects_ordinal_imports() {
        let mut r = record("a.exe", "ws2_32.dll", "");
        r.by_ordinal = true;
        r.ordinal = 23;
        assert!(func_matches(&r, "#23"));
        assert!(!func_matches(&r, "#24"));
        assert!(!func_matches(&r, "socket"));
    }

    #[test]
    fn name_matching_ignores_case_and_skips_ordinals() {
        let r = record("a.exe", "kernel32.dll", "WriteFile");
        assert!(func_matches(&r, "writefile"));
        assert!(!func_matches(&r, "#1"));
    }

    #[test]
    fn span_left_clamps_to_the_module() {
        assert_eq!(span_left(0x1000, 0x1800, 0x1000), 0x800);
        assert_eq!(span_left(0x1000, 0x2000, 0x1000), 0);
        assert_eq!(span_left(0x1000, 0x800, 0x1000), 0);
    }
}
