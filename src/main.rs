//! The kernel binary: mounts the boot volume and hands the machine to the
//! first user process.
#![no_std]
#![no_main]
#![feature(format_args_nl)]

extern crate alloc;

use libkernel::kernel::event;
use libkernel::process::{elf, Process};
use libkernel::{fs, println};

/// Name of the user program loaded from the volume's root directory
const INIT_PROGRAM: &str = "init";

/// Runs once on the first free core after all cores reach their event loops.
#[no_mangle]
fn kernel_main() {
    println!("Kernel online; mounting the boot volume");
    // SAFETY: This is the only mount, and nothing else touches the card
    unsafe {
        fs::mount_boot_volume();
    }

    let listing = fs::with_volume(|volume| {
        let root = volume.read_inode(fs::ext2::ROOT_INODE)?;
        volume.entries(&root)
    })
    .expect("The boot volume was just mounted");
    match listing {
        Ok(entries) => {
            println!("Root directory holds {} entries:", entries.len());
            for entry in entries {
                println!("  #{} {}", entry.inode, core::str::from_utf8(&entry.name).unwrap_or("?"));
            }
        }
        Err(err) => println!("Listing the root directory failed: {err}"),
    }

    match start_init() {
        Ok(()) => println!("Scheduled {INIT_PROGRAM}"),
        Err(message) => println!("Not starting a user process: {message}"),
    }
}

/// Loads the init program from the volume into a fresh process and schedules
/// it
fn start_init() -> Result<(), &'static str> {
    let image = fs::with_volume(|volume| {
        let inode = volume.lookup_path(INIT_PROGRAM)?;
        volume.read_to_vec(&inode)
    })
    .ok_or("no volume mounted")?
    .map_err(|_| "no init program on the volume")?;

    let process = Process::new().map_err(|_| "out of frames for the process")?;
    elf::load(&image, &process).map_err(|_| "the init image failed to load")?;
    event::schedule_event(move || process.run());
    Ok(())
}
