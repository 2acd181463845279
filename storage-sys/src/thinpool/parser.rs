// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::io::BufRead;
use std::str::FromStr;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use rayon::prelude::*;
use storage_diet::IntervalSet;

use crate::{Result, SysError};

/// Pool data blocks owned by one thin device
#[derive(Debug, Default)]
pub struct DeviceBlocks {
    pub device_id: u32,
    pub blocks: IntervalSet,
}

/// Thin devices of a pool keyed by device id
pub type DeviceMap = BTreeMap<u32, DeviceBlocks>;

impl DeviceBlocks {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            blocks: IntervalSet::new(),
        }
    }

    pub fn allocated(&self) -> u64 {
        self.blocks.total()
    }

    /// Blocks this device maps that `other` does not share.
    pub fn unique_blocks(&self, other: &DeviceBlocks) -> u64 {
        self.blocks
            .total()
            .saturating_sub(self.blocks.intersection_all(&other.blocks))
    }
}

/// Total blocks held exclusively by `snapshots` relative to the live `device`.
///
/// Ids missing from `devices` contribute nothing.
pub fn snapshot_unique_blocks(devices: &DeviceMap, device: u32, snapshots: &[u32]) -> u64 {
    let Some(live) = devices.get(&device) else {
        return snapshots
            .iter()
            .filter_map(|id| devices.get(id))
            .map(DeviceBlocks::allocated)
            .sum();
    };

    snapshots
        .par_iter()
        .filter_map(|id| devices.get(id))
        .map(|snapshot| snapshot.unique_blocks(live))
        .sum()
}

/// Collects devices while the dump is streamed
#[derive(Default)]
struct Collector {
    devices: DeviceMap,
    current: Option<DeviceBlocks>,
}

impl Collector {
    fn open(&mut self, element: &BytesStart<'_>, self_closing: bool) -> Result<()> {
        match element.local_name().as_ref() {
            b"device" => {
                if let Some(open) = &self.current {
                    return Err(SysError::parse(format!(
                        "device {} opened inside device {}",
                        numeric_attribute::<u32>(element, b"dev_id")?,
                        open.device_id
                    )));
                }
                self.current = Some(DeviceBlocks::new(numeric_attribute(element, b"dev_id")?));
                if self_closing {
                    self.close();
                }
            }
            b"range_mapping" => {
                let begin: u64 = numeric_attribute(element, b"data_begin")?;
                let length: u64 = numeric_attribute(element, b"length")?;
                if length > 0 {
                    let end = begin.checked_add(length - 1).ok_or_else(|| {
                        SysError::parse(format!("range at {begin} of length {length} overflows"))
                    })?;
                    self.blocks()?.insert(begin, end);
                }
            }
            b"single_mapping" => {
                let block: u64 = numeric_attribute(element, b"data_block")?;
                self.blocks()?.insert(block, block);
            }
            _ => {}
        }
        Ok(())
    }

    // Mappings arrive sorted, which leaves the tree degenerate until balanced.
    fn close(&mut self) {
        if let Some(mut device) = self.current.take() {
            device.blocks.balance();
            self.devices.insert(device.device_id, device);
        }
    }

    fn blocks(&mut self) -> Result<&mut IntervalSet> {
        self.current
            .as_mut()
            .map(|device| &mut device.blocks)
            .ok_or_else(|| SysError::parse("block mapping outside of a device element"))
    }
}

fn numeric_attribute<T: FromStr>(element: &BytesStart<'_>, name: &[u8]) -> Result<T> {
    let name_text = String::from_utf8_lossy(name);
    for attribute in element.attributes() {
        let attribute = attribute?;
        if attribute.key.local_name().as_ref() != name {
            continue;
        }
        let raw = std::str::from_utf8(&attribute.value)
            .map_err(|_| SysError::parse(format!("{name_text} is not UTF-8")))?;
        return raw
            .trim()
            .parse()
            .map_err(|_| SysError::parse(format!("invalid {name_text} value {raw:?}")));
    }

    Err(SysError::parse(format!(
        "<{}> is missing {name_text}",
        String::from_utf8_lossy(element.local_name().as_ref())
    )))
}

/// Parse `thin_dump -f xml` output into per-device block sets.
pub fn parse_metadata(input: impl BufRead) -> Result<DeviceMap> {
    let mut reader = Reader::from_reader(input);
    let mut buffer = Vec::new();
    let mut collector = Collector::default();

    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Start(element) => collector.open(&element, false)?,
            Event::Empty(element) => collector.open(&element, true)?,
            Event::End(element) if element.local_name().as_ref() == b"device" => collector.close(),
            Event::Eof => break,
            _ => {}
        }
        buffer.clear();
    }

    if let Some(open) = collector.current {
        return Err(SysError::parse(format!(
            "metadata dump ended inside device {}",
            open.device_id
        )));
    }
    Ok(collector.devices)
}
