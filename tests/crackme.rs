//! End-to-end scenarios against the sample CrackMe target.
//!
//! `TestMe.exe` compares a hard-coded password against an input immediate
//! and exits 0 only when they match. Each scenario defeats the check a
//! different way: flipping ZF at the comparison branch, patching the input,
//! copying the password over it, or overriding the return register. All of
//! these need a real Windows debuggee, so they are `#[ignore]`d unless the
//! binary sits next to the test runner.

#![cfg(windows)]

use wdbg::arch::debugreg::{DrSlot, HwAccess, HwLength};
use wdbg::arch::{Eflags, Register};
use wdbg::common::{Address, RawHandle};
use wdbg::{BreakpointAction, DebugEventHandler, Debugger};

const TARGET: &str = "TestMe.exe";

// File-relative addresses inside the CrackMe image.
const INPUT_RVA: Address = 0x1007;
const PASSWORD_RVA: Address = 0x100E;
const JE_RVA: Address = 0x1012;
const RET_RVA: Address = 0x101E;

#[cfg(target_arch = "x86")]
const RETURN_REGISTER: Register = Register::Eax;
#[cfg(not(target_arch = "x86"))]
const RETURN_REGISTER: Register = Register::Rax;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scenario {
    /// Flip ZF right before the JE so the comparison "succeeds".
    ChangeFlag,
    /// Patch the input immediate to equal the password.
    ChangeMemory,
    /// Read the password and write it over the input.
    CopyPassword,
    /// Same as ChangeFlag, via a DR1 execute breakpoint.
    HardwareFlag,
    /// Zero the return register at the final RET.
    OverrideReturn,
}

struct CrackMeSolver {
    scenario: Scenario,
    exit_code: Option<u32>,
}

impl DebugEventHandler for CrackMeSolver {
    fn on_start(&mut self, dbg: &mut Debugger, _image_base: Address, _entry_point: Address) {
        match self.scenario {
            Scenario::ChangeFlag => {
                dbg.set_breakpoint(dbg.aslr(JE_RVA)).unwrap();
            }
            Scenario::ChangeMemory => {
                dbg.write_value::<u32>(dbg.aslr(INPUT_RVA), &0x4242_4242).unwrap();
            }
            Scenario::CopyPassword => {
                let password: u32 = dbg.read_value(dbg.aslr(PASSWORD_RVA)).unwrap();
                dbg.write_value(dbg.aslr(INPUT_RVA), &password).unwrap();
            }
            Scenario::HardwareFlag => {
                dbg.set_hardware_breakpoint(
                    dbg.aslr(JE_RVA),
                    DrSlot::Dr1,
                    HwAccess::Execute,
                    HwLength::Byte,
                )
                .unwrap();
            }
            Scenario::OverrideReturn => {
                dbg.set_hardware_breakpoint(
                    dbg.aslr(RET_RVA),
                    DrSlot::Dr1,
                    HwAccess::Execute,
                    HwLength::Byte,
                )
                .unwrap();
            }
        }
    }

    fn on_breakpoint(
        &mut self,
        dbg: &mut Debugger,
        _address: Address,
        thread: RawHandle,
    ) -> BreakpointAction {
        if self.scenario == Scenario::ChangeFlag {
            dbg.set_flag(thread, Eflags::ZF, true).unwrap();
        }
        BreakpointAction::Break
    }

    fn on_hardware_breakpoint(
        &mut self,
        dbg: &mut Debugger,
        _address: Address,
        thread: RawHandle,
        _slot: DrSlot,
    ) -> BreakpointAction {
        match self.scenario {
            Scenario::HardwareFlag => {
                dbg.set_flag(thread, Eflags::ZF, true).unwrap();
            }
            Scenario::OverrideReturn => {
                dbg.set_register(thread, RETURN_REGISTER, 0).unwrap();
            }
            _ => {}
        }
        BreakpointAction::Restore
    }

    fn on_end(&mut self, _dbg: &mut Debugger, exit_code: u32, _pid: u32) {
        self.exit_code = Some(exit_code);
    }
}

fn solve(scenario: Scenario) -> u32 {
    let _ = pretty_env_logger::try_init();

    let mut solver = CrackMeSolver {
        scenario,
        exit_code: None,
    };
    let mut dbg = Debugger::new(false);
    dbg.start_process(TARGET).expect("failed to start the CrackMe target");
    dbg.run(&mut solver).expect("dispatch loop failed");
    solver.exit_code.expect("target never reported an exit code")
}

#[test]
#[ignore = "requires the TestMe.exe CrackMe binary"]
fn cracks_by_flipping_zf_at_the_branch() {
    assert_eq!(solve(Scenario::ChangeFlag), 0);
}

#[test]
#[ignore = "requires the TestMe.exe CrackMe binary"]
fn cracks_by_patching_the_input_immediate() {
    assert_eq!(solve(Scenario::ChangeMemory), 0);
}

#[test]
#[ignore = "requires the TestMe.exe CrackMe binary"]
fn cracks_by_copying_the_password_to_the_input() {
    assert_eq!(solve(Scenario::CopyPassword), 0);
}

#[test]
#[ignore = "requires the TestMe.exe CrackMe binary"]
fn cracks_by_flipping_zf_with_a_hardware_breakpoint() {
    assert_eq!(solve(Scenario::HardwareFlag), 0);
}

#[test]
#[ignore = "requires the TestMe.exe CrackMe binary"]
fn cracks_by_zeroing_the_return_register() {
    assert_eq!(solve(Scenario::OverrideReturn), 0);
}

// ===== attach/detach behavior against a live child =====

struct NullHandler;
impl DebugEventHandler for NullHandler {}

/// Spawn a child that stays alive for a while without showing UI.
fn spawn_idle_child() -> std::process::Child {
    std::process::Command::new("cmd.exe")
        .args(["/C", "ping -n 30 127.0.0.1 >nul"])
        .spawn()
        .expect("failed to spawn idle child")
}

fn first_executable_page(dbg: &Debugger) -> Address {
    const MEM_COMMIT: u32 = 0x1000;
    // Any of the PAGE_EXECUTE* protections.
    dbg.memory_pages()
        .into_iter()
        .find(|p| p.state == MEM_COMMIT && p.protect & 0xF0 != 0)
        .expect("target has no executable pages")
        .base
}

#[test]
#[ignore = "spawns and attaches to a live process"]
fn detach_leaves_the_target_memory_untouched() {
    let mut child = spawn_idle_child();

    let mut dbg = Debugger::new(false);
    dbg.attach_to_pid(child.id(), &mut NullHandler).unwrap();

    let address = first_executable_page(&dbg);
    let before: u8 = dbg.read_value(address).unwrap();

    for _ in 0..4 {
        dbg.set_breakpoint(address).unwrap();
        dbg.clear_breakpoint(address).unwrap();
    }

    let after: u8 = dbg.read_value(address).unwrap();
    assert_eq!(before, after);

    dbg.detach().unwrap();

    // The target must still be running after detach.
    assert!(child.try_wait().unwrap().is_none());
    child.kill().ok();
}

#[test]
#[ignore = "spawns and attaches to a live process"]
fn installing_over_an_existing_int3_does_not_double_record() {
    let mut child = spawn_idle_child();

    let mut dbg = Debugger::new(false);
    dbg.attach_to_pid(child.id(), &mut NullHandler).unwrap();

    let address = first_executable_page(&dbg);
    let original: u8 = dbg.read_value(address).unwrap();

    dbg.set_breakpoint(address).unwrap();
    dbg.set_breakpoint(address).unwrap();

    let recorded: Vec<_> = dbg.software_breakpoints().collect();
    assert_eq!(recorded, vec![(address, original)]);

    dbg.clear_breakpoint(address).unwrap();
    assert_eq!(dbg.read_value::<u8>(address).unwrap(), original);

    dbg.detach().unwrap();
    child.kill().ok();
}

#[test]
#[ignore = "spawns and attaches to a live process"]
fn hardware_breakpoint_set_then_clear_restores_debug_registers() {
    let mut child = spawn_idle_child();

    let mut dbg = Debugger::new(false);
    dbg.attach_to_pid(child.id(), &mut NullHandler).unwrap();

    let address = first_executable_page(&dbg);
    assert!(dbg.hardware_breakpoint_at(address).is_none());

    dbg.set_hardware_breakpoint(address, DrSlot::Dr2, HwAccess::Execute, HwLength::Byte)
        .unwrap();
    assert_eq!(dbg.hardware_breakpoint_at(address), Some(DrSlot::Dr2));
    let programmed = dbg
        .hardware_breakpoint_by_slot(DrSlot::Dr2)
        .expect("slot should be programmed");
    assert_eq!(programmed.address, address);
    assert_eq!(programmed.access, HwAccess::Execute);
    assert_eq!(programmed.length, HwLength::Byte);

    dbg.clear_hardware_breakpoint(DrSlot::Dr2).unwrap();
    assert!(dbg.hardware_breakpoint_at(address).is_none());
    assert!(dbg.hardware_breakpoints().is_empty());

    dbg.detach().unwrap();
    child.kill().ok();
}

#[test]
#[ignore = "spawns and attaches to a live process"]
fn execute_breakpoints_reject_wide_watches() {
    let mut child = spawn_idle_child();

    let mut dbg = Debugger::new(false);
    dbg.attach_to_pid(child.id(), &mut NullHandler).unwrap();

    let address = first_executable_page(&dbg);
    assert!(dbg
        .set_hardware_breakpoint(address, DrSlot::Dr0, HwAccess::Execute, HwLength::Dword)
        .is_err());
    assert!(dbg.hardware_breakpoint_at(address).is_none());

    dbg.detach().unwrap();
    child.kill().ok();
}
