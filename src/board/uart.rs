/// Documentation for the UART: <https://datasheets.raspberrypi.com/bcm2711/bcm2711-peripherals.pdf>
use crate::{board::Mmio, call_once, kernel, sync::SpinLock};
use core::fmt::{self, Write};
use tock_registers::{
    interfaces::Readable,
    register_bitfields, register_structs,
    registers::{ReadOnly, ReadWrite},
};

register_bitfields! {
    u32,
    /// The data register; writes push a character into the transmit FIFO,
    /// reads pop one from the receive FIFO together with its status bits.
    DR [
        /// Receive (read) data character.\
        /// Transmit (write) data character.
        DATA OFFSET(0) NUMBITS(8)
    ],

    /// The flag register reflects FIFO state.
    FR [
        /// Transmit FIFO is full; writes to `DR` would be dropped
        TXFF OFFSET(5) NUMBITS(1),
        /// Receive FIFO is empty; reads of `DR` would be garbage
        RXFE OFFSET(4) NUMBITS(1)
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => DR: ReadWrite<u32, DR::Register>),
        (0x04 => _reserved),
        (0x18 => FR: ReadOnly<u32, FR::Register>),
        (0x1C => @END),
    }
}

/// Abstraction for the associated MMIO registers.
type Registers = Mmio<RegisterBlock>;

/// Inner representation of the UART
struct UartInner {
    /// The UART registers, memory mapped
    registers: Registers,
}

/// Representation of the UART.
pub struct Uart {
    /// The protected UART
    inner: SpinLock<UartInner>,
}

impl UartInner {
    /// Creates a raw UART instance
    /// # Safety
    /// The address must be the UART's, and the range must not be used by
    /// anything else. This includes not initializing the UART multiple times
    const unsafe fn new(address: u64) -> Self {
        Self {
            // SAFETY: By assumption, the address is correct
            registers: unsafe { Registers::physical(address) },
        }
    }

    /// Sends a byte across the UART, blocking until the FIFO has space
    fn write_byte(&mut self, c: u8) {
        while self.registers.FR.matches_all(FR::TXFF::SET) {
            core::hint::spin_loop();
        }
        self.registers.DR.set(c.into());
    }

    /// Reads a byte from the UART, if one is available
    fn read_byte(&mut self) -> Option<u8> {
        if self.registers.FR.matches_all(FR::RXFE::SET) {
            return None;
        }
        u8::try_from(self.registers.DR.get() & 0xFF).ok()
    }
}

impl fmt::Write for UartInner {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }

        Ok(())
    }
}

impl Uart {
    /// Creates a UART instance
    /// # Safety
    /// The address must be the UART's, and the range must not be used by
    /// anything else
    const unsafe fn new(address: u64) -> Self {
        Self {
            inner: SpinLock::new(
                // SAFETY: By assumption, the address must be correct and proper
                unsafe { UartInner::new(address) },
            ),
        }
    }

    /// Initializes the UART. The firmware has already configured the baud
    /// rate and line settings.
    pub fn init(&self) {
        call_once!();
    }

    /// Writes a single byte out, blocking until the FIFO accepts it
    pub fn put_byte(&self, c: u8) {
        self.inner.lock().write_byte(c);
    }

    /// Writes a buffer of bytes out
    pub fn put_bytes(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        for &byte in bytes {
            inner.write_byte(byte);
        }
    }
}

impl kernel::Serial for Uart {
    fn write_fmt(&self, args: core::fmt::Arguments) {
        self.inner
            .lock()
            .write_fmt(args)
            .expect("Writing to the UART should not fail");
    }

    fn read_byte(&self) -> Option<u8> {
        self.inner.lock().read_byte()
    }
}

/// The system-wide UART
// SAFETY: This is the PL011's fixed location on the Raspberry Pi 3
static UART: Uart = unsafe { Uart::new(0x3F20_1000) };

/// Gets the system-wide serial connection
pub fn serial() -> &'static Uart {
    &UART
}
