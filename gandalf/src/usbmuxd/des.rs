// Jackson Coxson

use serde::Deserialize;

#[derive(Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "Number")]
    pub number: u64,
}

#[derive(Deserialize)]
pub struct AttachedMessage {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: PropertiesResponse,
}

#[derive(Deserialize)]
pub struct PropertiesResponse {
    #[serde(rename = "ConnectionSpeed")]
    pub connection_speed: Option<u64>,
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "LocationID")]
    pub location_id: Option<u64>,
    #[serde(rename = "ProductID")]
    pub product_id: Option<u64>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

#[derive(Deserialize)]
pub struct DetachedMessage {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
}
