//! Wire codec for the array controller link.
//!
//! Outbound command frames are a fixed 128 bytes: a little-endian `u32` tag in
//! bytes 0..4 followed by a tag-specific payload, everything else zero.
//! Inbound telemetry frames follow a [`FrameLayout`] picked from the revision
//! table at configuration time.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Size of every outbound command datagram.
pub const COMMAND_FRAME_LEN: usize = 128;

/// Offset of the byte-array payload (SET_PHASE codes, SET_LOSS code).
pub const PAYLOAD_OFFSET: usize = 16;

/// Bytes available for SET_PHASE codes.
pub const MAX_PHASE_PAYLOAD: usize = COMMAND_FRAME_LEN - PAYLOAD_OFFSET;

/// Command discriminant as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandTag {
    #[default]
    Nop = 0,
    Reset = 1,
    Scan = 2,
    Steer = 3,
    SetPhase = 4,
    SetLoss = 5,
}

impl CommandTag {
    pub fn from_wire(value: u32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(CommandTag::Nop),
            1 => Ok(CommandTag::Reset),
            2 => Ok(CommandTag::Scan),
            3 => Ok(CommandTag::Steer),
            4 => Ok(CommandTag::SetPhase),
            5 => Ok(CommandTag::SetLoss),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }

    pub fn wire(self) -> u32 {
        self as u32
    }

    pub fn is_nop(self) -> bool {
        self == CommandTag::Nop
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandTag::Nop => "NOP",
            CommandTag::Reset => "RESET",
            CommandTag::Scan => "SCAN",
            CommandTag::Steer => "STEER",
            CommandTag::SetPhase => "SET_PHASE",
            CommandTag::SetLoss => "SET_LOSS",
        }
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How the controller searches for peripherals during a SCAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMethod {
    #[default]
    Steering = 0,
    FullSweep = 1,
}

impl ScanMethod {
    fn from_wire(value: u32) -> Self {
        if value == ScanMethod::FullSweep as u32 {
            ScanMethod::FullSweep
        } else {
            ScanMethod::Steering
        }
    }
}

/// One outbound command with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommandFrame {
    #[default]
    Nop,
    Reset,
    Scan(ScanMethod),
    /// Point the array at the peripheral with this index.
    Steer(u32),
    /// One shifter code per element, row-major.
    SetPhase(Vec<u8>),
    /// Attenuator code, 0.25 dB per step.
    SetLoss(u8),
}

impl CommandFrame {
    pub fn tag(&self) -> CommandTag {
        match self {
            CommandFrame::Nop => CommandTag::Nop,
            CommandFrame::Reset => CommandTag::Reset,
            CommandFrame::Scan(_) => CommandTag::Scan,
            CommandFrame::Steer(_) => CommandTag::Steer,
            CommandFrame::SetPhase(_) => CommandTag::SetPhase,
            CommandFrame::SetLoss(_) => CommandTag::SetLoss,
        }
    }
}

/// Encodes a command into its 128-byte datagram.
pub fn encode_command(frame: &CommandFrame) -> Result<[u8; COMMAND_FRAME_LEN], FrameError> {
    let mut buf = [0u8; COMMAND_FRAME_LEN];
    buf[0..4].copy_from_slice(&frame.tag().wire().to_le_bytes());
    match frame {
        CommandFrame::Nop => buf = [0u8; COMMAND_FRAME_LEN],
        CommandFrame::Reset => {}
        CommandFrame::Scan(method) => {
            buf[4..8].copy_from_slice(&(*method as u32).to_le_bytes());
        }
        CommandFrame::Steer(target) => {
            buf[4..8].copy_from_slice(&target.to_le_bytes());
        }
        CommandFrame::SetPhase(codes) => {
            if codes.len() > MAX_PHASE_PAYLOAD {
                return Err(FrameError::PayloadTooLarge {
                    len: codes.len(),
                    max: MAX_PHASE_PAYLOAD,
                });
            }
            buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + codes.len()].copy_from_slice(codes);
        }
        CommandFrame::SetLoss(code) => buf[PAYLOAD_OFFSET] = *code,
    }
    Ok(buf)
}

/// Checks that `frame` encodes and, for SET_PHASE, carries one code per element.
pub fn validate_command(frame: &CommandFrame, elements: usize) -> Result<(), FrameError> {
    encode_command(frame)?;
    match frame {
        CommandFrame::SetPhase(codes) if codes.len() != elements => Err(FrameError::PhaseCount {
            expected: elements,
            actual: codes.len(),
        }),
        _ => Ok(()),
    }
}

/// Parses a command datagram. `elements` is the number of SET_PHASE codes to read.
pub fn decode_command(buf: &[u8], elements: usize) -> Result<CommandFrame, FrameError> {
    if buf.len() != COMMAND_FRAME_LEN {
        return Err(FrameError::WrongSize {
            expected: COMMAND_FRAME_LEN,
            actual: buf.len(),
        });
    }
    let elements = elements.min(MAX_PHASE_PAYLOAD);
    let frame = match CommandTag::from_wire(read_u32(buf, 0))? {
        CommandTag::Nop => CommandFrame::Nop,
        CommandTag::Reset => CommandFrame::Reset,
        CommandTag::Scan => CommandFrame::Scan(ScanMethod::from_wire(read_u32(buf, 4))),
        CommandTag::Steer => CommandFrame::Steer(read_u32(buf, 4)),
        CommandTag::SetPhase => {
            CommandFrame::SetPhase(buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + elements].to_vec())
        }
        CommandTag::SetLoss => CommandFrame::SetLoss(buf[PAYLOAD_OFFSET]),
    };
    Ok(frame)
}

/// Reads `count` signed phase codes starting at `offset`.
pub fn read_codes(buf: &[u8], offset: usize, count: usize) -> Vec<i8> {
    buf[offset..offset + count].iter().map(|&b| b as i8).collect()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Status byte reported by the array controller itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerStatus {
    #[default]
    Ready,
    Busy,
    NoConnection,
}

impl ControllerStatus {
    pub fn from_wire(code: u8) -> Result<Self, FrameError> {
        match code {
            0 => Ok(ControllerStatus::Ready),
            1 => Ok(ControllerStatus::Busy),
            255 => Ok(ControllerStatus::NoConnection),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }

    pub fn wire(self) -> u8 {
        match self {
            ControllerStatus::Ready => 0,
            ControllerStatus::Busy => 1,
            ControllerStatus::NoConnection => 255,
        }
    }
}

/// State reported for one receiver node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeripheralInfo {
    pub address: [u8; 6],
    /// Rectified RF level at the receiver.
    pub rfdc_adc: u16,
    pub battery_adc: u16,
    /// RF level recorded during the last scan.
    pub scan_rfdc: u16,
    /// Phase codes the peripheral asked the array to apply.
    pub phase_codes: Vec<i8>,
}

impl PeripheralInfo {
    /// An all-zero hardware address marks an empty slot.
    pub fn is_present(&self) -> bool {
        self.address.iter().any(|&b| b != 0)
    }
}

/// One decoded telemetry datagram.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TelemetryFrame {
    pub status: ControllerStatus,
    /// Command the firmware is currently executing (NOP when idle).
    pub echoed: CommandTag,
    pub attenuation: u8,
    pub current_phases: Vec<i8>,
    pub pa_powers: Vec<u16>,
    pub peripherals: Vec<PeripheralInfo>,
}

/// Byte layout of an inbound telemetry frame for one hardware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub revision: u8,
    pub frame_len: usize,
    pub status_offset: usize,
    pub echo_offset: usize,
    pub attenuation_offset: usize,
    pub phases_offset: usize,
    pub pa_offset: usize,
    pub peripherals_offset: usize,
    pub peripheral_stride: usize,
    pub elements: usize,
    pub peripherals: usize,
}

// offsets inside a peripheral block
const PERI_ADDRESS: usize = 0;
const PERI_RFDC: usize = 8;
const PERI_BATTERY: usize = 10;
const PERI_SCAN_RFDC: usize = 12;
const PERI_PHASES: usize = 16;

impl FrameLayout {
    /// Revision 3: 1248-byte frame, 16 elements, 5 peripheral slots.
    pub const CANONICAL: FrameLayout = FrameLayout {
        revision: 3,
        frame_len: 1248,
        status_offset: 0,
        echo_offset: 1,
        attenuation_offset: 2,
        phases_offset: 64,
        pa_offset: 128,
        peripherals_offset: 256,
        peripheral_stride: 128,
        elements: 16,
        peripherals: 5,
    };

    /// Rows of the revision table, keyed by revision number.
    const TABLE: &'static [FrameLayout] = &[FrameLayout::CANONICAL];

    /// Looks up `revision` and resizes it for the configured array.
    pub fn for_revision(revision: u8, elements: usize, peripherals: usize) -> Result<Self, FrameError> {
        let base = Self::TABLE
            .iter()
            .find(|l| l.revision == revision)
            .ok_or_else(|| FrameError::Layout(format!("no layout for revision {revision}")))?;
        let layout = FrameLayout {
            elements,
            peripherals,
            ..*base
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Checks that every block fits inside its slot and the frame.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.elements == 0 {
            return Err(FrameError::Layout("array has no elements".into()));
        }
        if self.phases_offset + self.elements > self.pa_offset {
            return Err(FrameError::Layout(format!(
                "{} phase codes overflow the phase block",
                self.elements
            )));
        }
        if self.pa_offset + 2 * self.elements > self.peripherals_offset {
            return Err(FrameError::Layout(format!(
                "{} PA readings overflow the PA block",
                self.elements
            )));
        }
        if PERI_PHASES + self.elements > self.peripheral_stride {
            return Err(FrameError::Layout(format!(
                "{} phase codes overflow a peripheral block",
                self.elements
            )));
        }
        if self.peripheral_offset(self.peripherals) > self.frame_len {
            return Err(FrameError::Layout(format!(
                "{} peripheral blocks overflow a {}-byte frame",
                self.peripherals, self.frame_len
            )));
        }
        Ok(())
    }

    pub fn peripheral_offset(&self, index: usize) -> usize {
        self.peripherals_offset + index * self.peripheral_stride
    }

    pub fn decode(&self, buf: &[u8]) -> Result<TelemetryFrame, FrameError> {
        if buf.len() != self.frame_len {
            return Err(FrameError::WrongSize {
                expected: self.frame_len,
                actual: buf.len(),
            });
        }
        let status = ControllerStatus::from_wire(buf[self.status_offset])?;
        let echoed = CommandTag::from_wire(buf[self.echo_offset] as u32)?;

        let pa_powers = (0..self.elements)
            .map(|i| read_u16(buf, self.pa_offset + 2 * i))
            .collect();
        let peripherals = (0..self.peripherals)
            .map(|p| {
                let base = self.peripheral_offset(p);
                let mut address = [0u8; 6];
                address.copy_from_slice(&buf[base + PERI_ADDRESS..base + PERI_ADDRESS + 6]);
                PeripheralInfo {
                    address,
                    rfdc_adc: read_u16(buf, base + PERI_RFDC),
                    battery_adc: read_u16(buf, base + PERI_BATTERY),
                    scan_rfdc: read_u16(buf, base + PERI_SCAN_RFDC),
                    phase_codes: read_codes(buf, base + PERI_PHASES, self.elements),
                }
            })
            .collect();

        Ok(TelemetryFrame {
            status,
            echoed,
            attenuation: buf[self.attenuation_offset],
            current_phases: read_codes(buf, self.phases_offset, self.elements),
            pa_powers,
            peripherals,
        })
    }

    /// Serializes a telemetry frame; the controller side of the link (emulator) uses this.
    pub fn encode(&self, frame: &TelemetryFrame) -> Vec<u8> {
        let mut buf = vec![0u8; self.frame_len];
        buf[self.status_offset] = frame.status.wire();
        buf[self.echo_offset] = frame.echoed.wire() as u8;
        buf[self.attenuation_offset] = frame.attenuation;
        write_codes(&mut buf, self.phases_offset, &frame.current_phases, self.elements);
        for (i, power) in frame.pa_powers.iter().take(self.elements).enumerate() {
            let at = self.pa_offset + 2 * i;
            buf[at..at + 2].copy_from_slice(&power.to_le_bytes());
        }
        for (p, peri) in frame.peripherals.iter().take(self.peripherals).enumerate() {
            let base = self.peripheral_offset(p);
            buf[base + PERI_ADDRESS..base + PERI_ADDRESS + 6].copy_from_slice(&peri.address);
            buf[base + PERI_RFDC..base + PERI_RFDC + 2].copy_from_slice(&peri.rfdc_adc.to_le_bytes());
            buf[base + PERI_BATTERY..base + PERI_BATTERY + 2]
                .copy_from_slice(&peri.battery_adc.to_le_bytes());
            buf[base + PERI_SCAN_RFDC..base + PERI_SCAN_RFDC + 2]
                .copy_from_slice(&peri.scan_rfdc.to_le_bytes());
            write_codes(&mut buf, base + PERI_PHASES, &peri.phase_codes, self.elements);
        }
        buf
    }
}

fn write_codes(buf: &mut [u8], offset: usize, codes: &[i8], limit: usize) {
    for (i, &code) in codes.iter().take(limit).enumerate() {
        buf[offset + i] = code as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(layout: &FrameLayout) -> TelemetryFrame {
        let empty = PeripheralInfo {
            phase_codes: vec![0; layout.elements],
            ..Default::default()
        };
        let mut peripherals = vec![empty; layout.peripherals];
        peripherals[1] = PeripheralInfo {
            address: [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01],
            rfdc_adc: 812,
            battery_adc: 3300,
            scan_rfdc: 700,
            phase_codes: (0..layout.elements as i8).collect(),
        };
        TelemetryFrame {
            status: ControllerStatus::Busy,
            echoed: CommandTag::Scan,
            attenuation: 40,
            current_phases: vec![-1; layout.elements],
            pa_powers: vec![300; layout.elements],
            peripherals,
        }
    }

    #[test]
    fn tag_occupies_first_four_bytes_little_endian() {
        let buf = encode_command(&CommandFrame::Steer(0x0102_0304)).unwrap();
        assert_eq!(&buf[0..4], &[3, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[4, 3, 2, 1]);
        assert!(buf[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn scan_and_loss_payloads() {
        let scan = encode_command(&CommandFrame::Scan(ScanMethod::FullSweep)).unwrap();
        assert_eq!(&scan[0..8], &[2, 0, 0, 0, 1, 0, 0, 0]);

        let loss = encode_command(&CommandFrame::SetLoss(127)).unwrap();
        assert_eq!(loss[0], 5);
        assert_eq!(loss[PAYLOAD_OFFSET], 127);
        assert_eq!(loss.iter().filter(|&&b| b != 0).count(), 2);

        let reset = encode_command(&CommandFrame::Reset).unwrap();
        assert_eq!(reset[0], 1);
        assert!(reset[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn set_phase_must_match_the_array() {
        assert!(validate_command(&CommandFrame::SetPhase(vec![3; 16]), 16).is_ok());
        assert_eq!(
            validate_command(&CommandFrame::SetPhase(vec![3; 15]), 16),
            Err(FrameError::PhaseCount {
                expected: 16,
                actual: 15
            })
        );
        assert!(matches!(
            validate_command(&CommandFrame::SetPhase(vec![0; 200]), 200),
            Err(FrameError::PayloadTooLarge { len: 200, .. })
        ));
        assert!(validate_command(&CommandFrame::Steer(4), 16).is_ok());
    }

    #[test]
    fn nop_is_all_zero() {
        let buf = encode_command(&CommandFrame::Nop).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn set_phase_codes_read_back_at_payload_offset() {
        let buf = encode_command(&CommandFrame::SetPhase(vec![3; 16])).unwrap();
        assert_eq!(read_codes(&buf, PAYLOAD_OFFSET, 16), vec![3i8; 16]);

        // a peripheral block shares the command frame's stride and phase offset
        let layout = FrameLayout::CANONICAL;
        let mut telemetry = layout.encode(&TelemetryFrame::default());
        let at = layout.peripheral_offset(0);
        telemetry[at..at + COMMAND_FRAME_LEN].copy_from_slice(&buf);
        let decoded = layout.decode(&telemetry).unwrap();
        assert_eq!(decoded.peripherals[0].phase_codes, vec![3i8; 16]);
    }

    #[test]
    fn oversized_phase_payload_is_rejected() {
        let err = encode_command(&CommandFrame::SetPhase(vec![0; 113])).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge { len: 113, max: 112 });
    }

    #[test]
    fn command_decode_inverts_encode() {
        for frame in [
            CommandFrame::Nop,
            CommandFrame::Reset,
            CommandFrame::Scan(ScanMethod::Steering),
            CommandFrame::Steer(4),
            CommandFrame::SetPhase((0..16).collect()),
            CommandFrame::SetLoss(9),
        ] {
            let buf = encode_command(&frame).unwrap();
            assert_eq!(decode_command(&buf, 16).unwrap(), frame);
        }
    }

    #[test]
    fn unknown_command_tag_is_an_error() {
        let mut buf = [0u8; COMMAND_FRAME_LEN];
        buf[0] = 9;
        assert_eq!(decode_command(&buf, 16), Err(FrameError::UnknownCommand(9)));
        assert!(matches!(
            decode_command(&buf[..64], 16),
            Err(FrameError::WrongSize { expected: 128, actual: 64 })
        ));
    }

    #[test]
    fn telemetry_survives_encode_decode() {
        let layout = FrameLayout::CANONICAL;
        let frame = sample_frame(&layout);
        let bytes = layout.encode(&frame);
        assert_eq!(bytes.len(), 1248);
        let decoded = layout.decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert!(!decoded.peripherals[0].is_present());
        assert!(decoded.peripherals[1].is_present());
    }

    #[test]
    fn canonical_offsets_match_the_firmware() {
        let layout = FrameLayout::CANONICAL;
        let bytes = layout.encode(&sample_frame(&layout));
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 2);
        assert_eq!(bytes[2], 40);
        assert_eq!(bytes[64], 0xff);
        assert_eq!(u16::from_le_bytes([bytes[128], bytes[129]]), 300);
        let p1 = 256 + 128;
        assert_eq!(bytes[p1], 0xde);
        assert_eq!(u16::from_le_bytes([bytes[p1 + 8], bytes[p1 + 9]]), 812);
        assert_eq!(u16::from_le_bytes([bytes[p1 + 10], bytes[p1 + 11]]), 3300);
        assert_eq!(bytes[p1 + 16 + 5], 5);
    }

    #[test]
    fn malformed_telemetry_is_reported_not_panicked() {
        let layout = FrameLayout::CANONICAL;
        assert!(matches!(
            layout.decode(&[0u8; 64]),
            Err(FrameError::WrongSize { expected: 1248, actual: 64 })
        ));
        let mut bytes = layout.encode(&TelemetryFrame::default());
        bytes[0] = 7;
        assert_eq!(layout.decode(&bytes), Err(FrameError::UnknownStatus(7)));
        bytes[0] = 255;
        bytes[1] = 42;
        assert_eq!(layout.decode(&bytes), Err(FrameError::UnknownCommand(42)));
    }

    #[test]
    fn layout_table_resizes_and_validates() {
        let l = FrameLayout::for_revision(3, 64, 7).unwrap();
        assert_eq!(l.elements, 64);
        assert_eq!(l.frame_len, 1248);
        assert!(FrameLayout::for_revision(3, 65, 5).is_err());
        assert!(FrameLayout::for_revision(3, 16, 8).is_err());
        assert!(FrameLayout::for_revision(1, 16, 5).is_err());
    }
}
