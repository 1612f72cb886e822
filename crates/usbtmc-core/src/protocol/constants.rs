//! Protocol constants from the USB Test & Measurement Class specification
//! (USBTMC 1.0) and its USB488 subclass.

use std::time::Duration;

// ============================================================================
// Interface Identification
// ============================================================================

/// Application-specific interface class.
pub const USBTMC_INTERFACE_CLASS: u8 = 0xFE;
/// Test & measurement subclass.
pub const USBTMC_INTERFACE_SUBCLASS: u8 = 0x03;
/// Plain USBTMC interface protocol.
pub const USBTMC_PROTOCOL: u8 = 0x00;
/// USB488 interface protocol (status byte, trigger, remote/local).
pub const USB488_PROTOCOL: u8 = 0x01;

// ============================================================================
// Vendor Quirks
// ============================================================================

/// Rigol: responses framed as IEEE 488.2 definite-length blocks.
pub const RIGOL_VENDOR_ID: u16 = 0x1AB1;

/// Advantest / ADCMT: lockable, reports a diagnostic id, mis-describes its
/// interface class.
pub const ADVANTEST_VENDOR_ID: u16 = 0x1334;

/// Agilent / Keysight.
pub const AGILENT_VENDOR_ID: u16 = 0x0957;

/// Agilent U27xx modular instruments enumerate with a different product id
/// while in firmware update mode: `(update mode, normal mode)`.
pub const AGILENT_FIRMWARE_UPDATE_PIDS: &[(u16, u16)] = &[
    (0x2818, 0x2918), // U2701A/U2702A
    (0x4218, 0x4118), // U2722A
    (0x4418, 0x4318), // U2723A
];

/// Vendors whose instruments may not advertise the USBTMC class code.
pub const CLASS_ALLOW_LIST: &[u16] = &[ADVANTEST_VENDOR_ID];

// ============================================================================
// Bulk Message IDs
// ============================================================================

pub const MSGID_DEV_DEP_MSG_OUT: u8 = 1;
pub const MSGID_REQUEST_DEV_DEP_MSG_IN: u8 = 2;
pub const MSGID_DEV_DEP_MSG_IN: u8 = 2;
pub const MSGID_VENDOR_SPECIFIC_OUT: u8 = 126;
pub const MSGID_REQUEST_VENDOR_SPECIFIC_IN: u8 = 127;
pub const MSGID_VENDOR_SPECIFIC_IN: u8 = 127;
/// USB488 only.
pub const MSGID_TRIGGER: u8 = 128;

// ============================================================================
// Class Requests (USBTMC)
// ============================================================================

pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
pub const INITIATE_ABORT_BULK_IN: u8 = 3;
pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
pub const INITIATE_CLEAR: u8 = 5;
pub const CHECK_CLEAR_STATUS: u8 = 6;
pub const GET_CAPABILITIES: u8 = 7;
pub const INDICATOR_PULSE: u8 = 64;

// ============================================================================
// Class Requests (USB488)
// ============================================================================

pub const READ_STATUS_BYTE: u8 = 128;
pub const REN_CONTROL: u8 = 160;
pub const GO_TO_LOCAL: u8 = 161;
pub const LOCAL_LOCKOUT: u8 = 162;

// ============================================================================
// Vendor Requests (Advantest)
// ============================================================================

/// Lock (`wValue = 1`) or unlock (`wValue = 0`) the front panel.
pub const ADVANTEST_LOCK: u8 = 0xA0;
/// Read the "MyID" diagnostic identifier.
pub const ADVANTEST_READ_MYID: u8 = 0xF5;

// ============================================================================
// Status Codes (Device -> Host)
// ============================================================================

pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_PENDING: u8 = 0x02;
pub const STATUS_FAILED: u8 = 0x80;
pub const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;
pub const STATUS_SPLIT_NOT_IN_PROGRESS: u8 = 0x82;
pub const STATUS_SPLIT_IN_PROGRESS: u8 = 0x83;

// ============================================================================
// Sizes
// ============================================================================

/// Bulk envelope size.
pub const HEADER_SIZE: usize = 12;
/// GET_CAPABILITIES response length.
pub const CAPABILITIES_SIZE: u16 = 0x18;
/// Read requests ask for at most this many payload bytes by default.
pub const DEFAULT_MAX_TRANSFER_SIZE: u32 = 1024 * 1024;
/// USB488 interrupt-IN notification size.
pub const INTERRUPT_NOTIFICATION_SIZE: usize = 2;

// ============================================================================
// Timing
// ============================================================================

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_STATUS_POLLS: u32 = 50;

// ============================================================================
// Basic-protocol fallbacks (IEEE 488.2 common commands)
// ============================================================================

pub const STATUS_BYTE_QUERY: &str = "*STB?";
pub const TRIGGER_COMMAND: &str = "*TRG";
