//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.
//!
//! Scanning is active so that scan responses (which usually carry the local
//! name) are received too. Names and service lists are remembered per
//! address and merged into the next report that carries manufacturer data.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisements, RawAdvertisement, ScanError, uuid_from_u16,
};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_ACTIVE: u8 = 0x01;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// AD types
const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
const AD_TYPE_UUID128_INCOMPLETE: u8 = 0x06;
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;
const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Upper bound on remembered scan-response entries.
const MAX_TRACKED_DEVICES: usize = 1024;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

fn last_os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(last_os_error("Failed to create HCI socket"));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(last_os_error("Failed to bind HCI socket"));
    }

    Ok(())
}

/// Set HCI socket filter
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(last_os_error("Failed to set HCI filter"));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(last_os_error("Failed to send HCI command"));
    }

    Ok(())
}

/// Parameters of LE Set Scan Parameters, little-endian on the wire.
fn scan_parameters() -> [u8; 7] {
    // 10ms interval and window, in 0.625ms units
    let interval: u16 = 0x0010;
    let window: u16 = 0x0010;
    let [i0, i1] = interval.to_le_bytes();
    let [w0, w1] = window.to_le_bytes();
    [
        LE_SCAN_ACTIVE,
        i0,
        i1,
        w0,
        w1,
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

/// Configure and enable LE scanning
fn configure_le_scan(fd: &OwnedFd) -> Result<(), ScanError> {
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters());
    send_hci_command(fd, &packet)?;

    // enable = 1, filter_dup = 0: every advertisement is reported
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00]);
    send_hci_command(fd, &packet)?;

    Ok(())
}

/// Fields extracted from a single advertising report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Report {
    address: MacAddress,
    rssi: i16,
    local_name: Option<String>,
    services: BTreeSet<Uuid>,
    manufacturer_data: Option<Vec<u8>>,
}

/// Parse the first report of an LE advertising report event.
fn parse_advertising_report(data: &[u8]) -> Option<Report> {
    // Skip HCI header (1 byte packet type + 1 byte event code + 1 byte param len + 1 byte subevent)
    let report = data.get(4..)?;

    // num_reports(1) + event_type(1) + addr_type(1) + addr(6) + data_len(1)
    if report.len() < 10 || report[0] == 0 {
        return None;
    }

    // HCI uses little-endian address
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);
    addr.reverse();

    let data_len = report[9] as usize;
    let ad_data = report.get(10..10 + data_len)?;
    let rssi = report.get(10 + data_len).map_or(0, |&b| i16::from(b as i8));

    let mut parsed = Report {
        address: MacAddress::from(addr),
        rssi,
        ..Default::default()
    };

    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        let value = &ad_data[offset + 2..offset + 1 + len];

        match ad_type {
            AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE => {
                parsed.services.extend(
                    value
                        .chunks_exact(2)
                        .map(|c| uuid_from_u16(u16::from_le_bytes([c[0], c[1]]))),
                );
            }
            AD_TYPE_UUID128_INCOMPLETE | AD_TYPE_UUID128_COMPLETE => {
                parsed.services.extend(value.chunks_exact(16).map(|c| {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(c);
                    Uuid::from_u128(u128::from_le_bytes(bytes))
                }));
            }
            AD_TYPE_SHORT_NAME | AD_TYPE_COMPLETE_NAME => {
                parsed.local_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_TYPE_MANUFACTURER_DATA => {
                parsed.manufacturer_data = Some(value.to_vec());
            }
            _ => {}
        }

        offset += 1 + len;
    }

    Some(parsed)
}

/// Merges advertising data and scan responses per device.
#[derive(Debug, Default)]
struct Assembler {
    seen: HashMap<MacAddress, (Option<String>, BTreeSet<Uuid>)>,
}

impl Assembler {
    /// Remember the report's name and services, and emit an advertisement
    /// when it carries manufacturer data.
    fn ingest(&mut self, report: Report) -> Option<RawAdvertisement> {
        if self.seen.len() >= MAX_TRACKED_DEVICES && !self.seen.contains_key(&report.address) {
            self.seen.clear();
        }

        let entry = self.seen.entry(report.address).or_default();
        if report.local_name.is_some() {
            entry.0 = report.local_name;
        }
        if !report.services.is_empty() {
            entry.1 = report.services;
        }

        let manufacturer_data = report.manufacturer_data?;
        Some(RawAdvertisement {
            address: report.address,
            rssi: report.rssi,
            local_name: entry.0.clone(),
            services: entry.1.clone(),
            manufacturer_data,
        })
    }
}

/// What the reader does after one `read(2)` on the HCI socket.
#[derive(Debug)]
enum ReadStep {
    Packet(usize),
    Retry,
    Stop(io::Error),
}

fn read_step(result: io::Result<usize>) -> ReadStep {
    match result {
        Ok(0) => ReadStep::Stop(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "HCI socket returned end of stream",
        )),
        Ok(n) => ReadStep::Packet(n),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadStep::Retry,
        Err(e) => ReadStep::Stop(e),
    }
}

/// Start scanning using raw HCI sockets on `hci0`.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan() -> Result<Advertisements, ScanError> {
    // Open and configure HCI socket for receiving events
    let fd = open_hci_socket()?;
    bind_hci_socket(&fd, 0)?;
    set_hci_filter(&fd)?;

    // Separate socket for sending commands
    let cmd_fd = open_hci_socket()?;
    bind_hci_socket(&cmd_fd, 0)?;
    configure_le_scan(&cmd_fd)?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

    tokio::spawn(async move {
        let _cmd_fd = cmd_fd; // Keep command socket alive
        let mut buf = [0u8; 258]; // Max HCI event size
        let mut assembler = Assembler::default();

        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "HCI socket closed");
                    return;
                }
            };

            // Drain all available packets before waiting again
            loop {
                let result = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(result) => result,
                    Err(_would_block) => break,
                };

                // Readiness is only cleared on WouldBlock
                let n = match read_step(result) {
                    ReadStep::Packet(n) => n,
                    ReadStep::Retry => continue,
                    ReadStep::Stop(e) => {
                        warn!(error = %e, "HCI read failed, stopping scan");
                        return;
                    }
                };

                if n >= 4
                    && buf[0] == HCI_EVENT_PKT
                    && buf[1] == EVT_LE_META_EVENT
                    && buf[3] == EVT_LE_ADVERTISING_REPORT
                    && let Some(advertisement) =
                        parse_advertising_report(&buf[..n]).and_then(|r| assembler.ingest(r))
                    && tx.send(advertisement).await.is_err()
                {
                    return;
                }
            }
        }
    });

    Ok(rx)
}
