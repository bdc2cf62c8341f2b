//! Output formatting: table via `tabled`, JSON via serde.

use std::sync::Arc;

use tabled::{Table, Tabled, settings::Style};

use emslink_api::Device;

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "COMMENT")]
    comment: String,
    #[tabled(rename = "TYPE")]
    producttype: String,
    #[tabled(rename = "ONLINE")]
    online: bool,
}

pub fn device_table(devices: &[Arc<Device>]) -> String {
    let rows: Vec<DeviceRow> = devices
        .iter()
        .map(|device| {
            let metadata = device.metadata();
            DeviceRow {
                name: metadata.name,
                comment: metadata.comment,
                producttype: metadata.producttype,
                online: metadata.online,
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

pub fn device_json(devices: &[Arc<Device>]) -> String {
    let metadata: Vec<_> = devices.iter().map(|device| device.metadata()).collect();
    serde_json::to_string_pretty(&metadata).unwrap_or_else(|_| "[]".into())
}
