//! The eMMC host controller driving the SD card slot.
//!
//! Polling only: the card is brought up through the standard identification
//! dance (idle, interface condition, operating condition, CID, RCA, select)
//! and then moves single 512-byte sectors through the `DATA` register. Every
//! wait is bounded by a coarse retry counter; expiry surfaces as
//! [`DeviceStatus::Timeout`] to the caller, which decides whether to retry.

use crate::board::{timer, Mmio};
use crate::fs::device::{DeviceStatus, SectorDevice, SECTOR_SIZE};
use tock_registers::{
    fields::FieldValue,
    interfaces::{ReadWriteable, Readable, Writeable},
    register_bitfields, register_structs,
    registers::ReadWrite,
};

register_bitfields![u32,
    BLKSIZECNT [
        BLKCNT OFFSET(16) NUMBITS(16),
        BLKSIZE OFFSET(0) NUMBITS(10)
    ],
    CMDTM [
        CMD_INDEX OFFSET(24) NUMBITS(6) [
            GoIdleState = 0,
            AllSendCid = 2,
            SendRelativeAddr = 3,
            SelectCard = 7,
            SendIFCond = 8,
            SetBlocklen = 16,
            ReadSingleBlock = 17,
            WriteSingleBlock = 24,
            SDSendOpCond = 41,
            AppCmd = 55,
        ],
        CMD_ISDATA OFFSET(21) NUMBITS(1) [],
        CMD_RSPNS_TYPE OFFSET(16) NUMBITS(2) [
            NoResponse = 0b00,
            Bits136 = 0b01,
            Bits48 = 0b10,
            Bits48Busy = 0b11,
        ],
        TM_DAT_DIR OFFSET(4) NUMBITS(1) [
            HostToCard = 0b0,
            CardToHost = 0b1,
        ],
    ],
    STATUS [
        DAT_INHIBIT OFFSET(1) NUMBITS(1),
        CMD_INHIBIT OFFSET(0) NUMBITS(1),
    ],
    CONTROL1 [
        SRST_HC OFFSET(24) NUMBITS(1),
        DATA_TOUNIT OFFSET(16) NUMBITS(4),
        CLK_FREQ8 OFFSET(8) NUMBITS(8),
        CLK_FREQ_MS2 OFFSET(6) NUMBITS(2),
        CLK_EN OFFSET(2) NUMBITS(1),
        CLK_STABLE OFFSET(1) NUMBITS(1),
        CLK_INTLEN OFFSET(0) NUMBITS(1),
    ],
    INTERRUPT [
        DTO_ERR OFFSET(20) NUMBITS(1),
        CTO_ERR OFFSET(12) NUMBITS(1),
        READ_RDY OFFSET(5) NUMBITS(1),
        WRITE_RDY OFFSET(4) NUMBITS(1),
        DATA_DONE OFFSET(1) NUMBITS(1),
        CMD_DONE OFFSET(0) NUMBITS(1),
    ]
];

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => _reserved1),
        (0x04 => BLKSIZECNT: ReadWrite<u32, BLKSIZECNT::Register>),
        (0x08 => ARG1: ReadWrite<u32>),
        (0x0C => CMDTM: ReadWrite<u32, CMDTM::Register>),
        (0x10 => RESP0: ReadWrite<u32>),
        (0x14 => RESP1: ReadWrite<u32>),
        (0x18 => RESP2: ReadWrite<u32>),
        (0x1C => RESP3: ReadWrite<u32>),
        (0x20 => DATA: ReadWrite<u32>),
        (0x24 => STATUS: ReadWrite<u32, STATUS::Register>),
        (0x28 => CONTROL0: ReadWrite<u32>),
        (0x2C => CONTROL1: ReadWrite<u32, CONTROL1::Register>),
        (0x30 => INTERRUPT: ReadWrite<u32, INTERRUPT::Register>),
        (0x34 => IRPT_MASK: ReadWrite<u32, INTERRUPT::Register>),
        (0x38 => IRPT_EN: ReadWrite<u32, INTERRUPT::Register>),
        (0x3C => @END),
    }
}

/// How many polls a bounded wait performs before reporting a timeout
const RETRY_LIMIT: u32 = 100_000;
/// Clock rate used during card identification
const INIT_FREQUENCY: u32 = 400_000;
/// Clock rate used for data transfer
const MAIN_FREQUENCY: u32 = 2_500_000;
/// The controller's base clock, used to derive dividers
const BASE_FREQUENCY: u32 = 41_666_667;

/// The eMMC host controller
pub struct Emmc {
    /// The controller's memory mapped registers
    registers: Mmio<RegisterBlock>,
    /// The card's relative address, learned during identification
    rca: u16,
}

impl Emmc {
    /// Creates an uninitialized handle to the controller
    ///
    /// # Safety
    ///
    /// Only one handle may exist, and `init` must succeed before any I/O
    pub const unsafe fn new() -> Self {
        Self {
            // SAFETY: This is the controller's fixed location on the
            // Raspberry Pi 3
            registers: unsafe { Mmio::physical(0x3F30_0000) },
            rca: 0,
        }
    }

    /// Polls until `condition` holds, or the retry counter expires
    fn wait_until(mut condition: impl FnMut() -> bool) -> Result<(), DeviceStatus> {
        for _ in 0..RETRY_LIMIT {
            if condition() {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(DeviceStatus::Timeout)
    }

    /// Issues a command and waits for its completion
    fn send_command(
        &mut self,
        command: FieldValue<u32, CMDTM::Register>,
        argument: u32,
    ) -> Result<(), DeviceStatus> {
        Self::wait_until(|| {
            !self
                .registers
                .STATUS
                .matches_any(STATUS::CMD_INHIBIT::SET)
        })?;
        // Acknowledge whatever interrupts are still latched
        self.registers.INTERRUPT.set(self.registers.INTERRUPT.get());
        self.registers.ARG1.set(argument);
        self.registers.CMDTM.write(command);
        timer::delay_us(100);
        Self::wait_until(|| {
            self.registers
                .INTERRUPT
                .matches_any(INTERRUPT::CMD_DONE::SET + INTERRUPT::CTO_ERR::SET)
        })?;
        if self.registers.INTERRUPT.matches_any(INTERRUPT::CTO_ERR::SET) {
            return Err(DeviceStatus::Error);
        }
        Ok(())
    }

    /// Issues an application-specific command (`CMD55` prefix)
    fn send_app_command(
        &mut self,
        command: FieldValue<u32, CMDTM::Register>,
        argument: u32,
    ) -> Result<(), DeviceStatus> {
        self.send_command(
            CMDTM::CMD_INDEX::AppCmd + CMDTM::CMD_RSPNS_TYPE::Bits48,
            u32::from(self.rca) << 16,
        )?;
        self.send_command(command, argument)
    }

    /// Reprograms the SD clock divider
    fn set_clock_frequency(&mut self, hz: u32) -> Result<(), DeviceStatus> {
        Self::wait_until(|| {
            !self
                .registers
                .STATUS
                .matches_any(STATUS::CMD_INHIBIT::SET + STATUS::DAT_INHIBIT::SET)
        })?;

        self.registers.CONTROL1.modify(CONTROL1::CLK_EN::CLEAR);
        timer::delay_us(10);

        let divisor = BASE_FREQUENCY.div_ceil(hz);
        self.registers.CONTROL1.modify(
            CONTROL1::CLK_FREQ8.val(divisor & 0xFF) + CONTROL1::CLK_FREQ_MS2.val(divisor >> 8),
        );
        timer::delay_us(10);

        self.registers.CONTROL1.modify(CONTROL1::CLK_EN::SET);
        Self::wait_until(|| {
            self.registers
                .CONTROL1
                .matches_any(CONTROL1::CLK_STABLE::SET)
        })
    }

    /// Negotiates the operating condition until the card reports ready
    fn sd_send_op_cond(&mut self) -> Result<(), DeviceStatus> {
        // Advertise high-capacity support at the normal voltage window
        const ARG: u32 = 0x40FF_8000;
        for _ in 0..RETRY_LIMIT {
            self.send_app_command(
                CMDTM::CMD_INDEX::SDSendOpCond + CMDTM::CMD_RSPNS_TYPE::Bits48,
                ARG,
            )?;
            if self.registers.RESP0.get() & 0x8000_0000 != 0 {
                return Ok(());
            }
            timer::delay_us(100);
        }
        Err(DeviceStatus::Timeout)
    }

    /// Transfers one sector's worth of words through the `DATA` register
    fn transfer_sector(
        &mut self,
        buffer: &mut [u8],
        to_card: bool,
    ) -> Result<(), DeviceStatus> {
        let ready = if to_card {
            INTERRUPT::WRITE_RDY::SET
        } else {
            INTERRUPT::READ_RDY::SET
        };
        Self::wait_until(|| self.registers.INTERRUPT.matches_any(ready))?;
        if self.registers.INTERRUPT.matches_any(INTERRUPT::DTO_ERR::SET) {
            return Err(DeviceStatus::Error);
        }

        for chunk in buffer.chunks_exact_mut(4) {
            if to_card {
                self.registers
                    .DATA
                    .set(u32::from_le_bytes(chunk.try_into().expect("Chunks are 4 bytes")));
            } else {
                chunk.copy_from_slice(&self.registers.DATA.get().to_le_bytes());
            }
        }
        Self::wait_until(|| {
            self.registers
                .INTERRUPT
                .matches_any(INTERRUPT::DATA_DONE::SET + INTERRUPT::DTO_ERR::SET)
        })?;
        if self.registers.INTERRUPT.matches_any(INTERRUPT::DTO_ERR::SET) {
            return Err(DeviceStatus::Error);
        }
        Ok(())
    }

    /// Moves one 512-byte sector in the given direction
    fn sector_io(&mut self, sector: u32, buffer: &mut [u8], to_card: bool) -> Result<(), DeviceStatus> {
        self.registers
            .BLKSIZECNT
            .write(BLKSIZECNT::BLKSIZE.val(SECTOR_SIZE as u32) + BLKSIZECNT::BLKCNT.val(1));
        let command = if to_card {
            CMDTM::CMD_INDEX::WriteSingleBlock
                + CMDTM::CMD_RSPNS_TYPE::Bits48
                + CMDTM::CMD_ISDATA::SET
                + CMDTM::TM_DAT_DIR::HostToCard
        } else {
            CMDTM::CMD_INDEX::ReadSingleBlock
                + CMDTM::CMD_RSPNS_TYPE::Bits48
                + CMDTM::CMD_ISDATA::SET
                + CMDTM::TM_DAT_DIR::CardToHost
        };
        // Standard-capacity cards take byte addresses
        self.send_command(command, sector * SECTOR_SIZE as u32)?;
        self.transfer_sector(buffer, to_card)
    }
}

impl SectorDevice for Emmc {
    fn init(&mut self) -> DeviceStatus {
        /// Collapses the fallible bring-up into a status
        fn bring_up(emmc: &mut Emmc) -> Result<(), DeviceStatus> {
            // Reset the host controller
            emmc.registers.CONTROL0.set(0);
            emmc.registers.CONTROL1.write(CONTROL1::SRST_HC::SET);
            Emmc::wait_until(|| {
                !emmc
                    .registers
                    .CONTROL1
                    .matches_all(CONTROL1::SRST_HC::SET)
            })?;

            // Internal clock on, maximum data timeout
            emmc.registers
                .CONTROL1
                .modify(CONTROL1::DATA_TOUNIT.val(0b1110) + CONTROL1::CLK_INTLEN::SET);
            emmc.set_clock_frequency(INIT_FREQUENCY)?;

            // Latch every interrupt; we poll the latch rather than take IRQs
            emmc.registers.IRPT_MASK.set(0xFFFF_FFFF);
            emmc.registers.IRPT_EN.set(0xFFFF_FFFF);

            emmc.send_command(CMDTM::CMD_INDEX::GoIdleState, 0)?;

            // Interface condition: 0xAA check pattern at normal voltage
            emmc.send_command(
                CMDTM::CMD_INDEX::SendIFCond + CMDTM::CMD_RSPNS_TYPE::Bits48,
                0x1AA,
            )?;
            if emmc.registers.RESP0.get() != 0x1AA {
                return Err(DeviceStatus::Fail);
            }

            emmc.sd_send_op_cond()?;
            emmc.send_command(
                CMDTM::CMD_INDEX::AllSendCid + CMDTM::CMD_RSPNS_TYPE::Bits136,
                0,
            )?;
            emmc.send_command(
                CMDTM::CMD_INDEX::SendRelativeAddr + CMDTM::CMD_RSPNS_TYPE::Bits48,
                0,
            )?;
            emmc.rca = u16::try_from(emmc.registers.RESP0.get() >> 16)
                .expect("The RCA is the upper half of the response");

            emmc.set_clock_frequency(MAIN_FREQUENCY)?;
            emmc.send_command(
                CMDTM::CMD_INDEX::SelectCard + CMDTM::CMD_RSPNS_TYPE::Bits48Busy,
                u32::from(emmc.rca) << 16,
            )?;
            emmc.send_command(
                CMDTM::CMD_INDEX::SetBlocklen + CMDTM::CMD_RSPNS_TYPE::Bits48,
                SECTOR_SIZE as u32,
            )
        }

        match bring_up(self) {
            Ok(()) => DeviceStatus::Success,
            Err(status) => status,
        }
    }

    fn read(
        &mut self,
        start_sector: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<usize, DeviceStatus> {
        assert!(buffer.len() >= count as usize * SECTOR_SIZE);
        let mut transferred = 0;
        for index in 0..count {
            let sector = &mut buffer[transferred..transferred + SECTOR_SIZE];
            self.sector_io(start_sector + index, sector, false)?;
            transferred += SECTOR_SIZE;
        }
        Ok(transferred)
    }

    fn write(
        &mut self,
        start_sector: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<usize, DeviceStatus> {
        assert!(buffer.len() >= count as usize * SECTOR_SIZE);
        let mut transferred = 0;
        let mut sector_buffer = [0_u8; SECTOR_SIZE];
        for index in 0..count {
            sector_buffer.copy_from_slice(&buffer[transferred..transferred + SECTOR_SIZE]);
            self.sector_io(start_sector + index, &mut sector_buffer, true)?;
            transferred += SECTOR_SIZE;
        }
        Ok(transferred)
    }
}
