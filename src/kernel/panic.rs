#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use crate::{architecture, println};
    let (file, line, column) = match info.location() {
        Some(loc) => (loc.file(), loc.line(), loc.column()),
        _ => ("Unknown file", 0, 0),
    };

    println!("PANIC at {}:{}:{}\n{}", file, line, column, info.message());

    // Shutdown badly
    architecture::shutdown(1);
}
