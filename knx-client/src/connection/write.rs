//! Write side of the orchestrator

use super::knx_connection::KnxConnection;
use crate::error::{KnxError, KnxResult};
use crate::payload::encode_group_write;
use knx_application::{Apdu, Cemi, Destination, LDataFrame, Priority};
use knx_core::{GroupAddressTag, IndividualAddress, KnxTag, PlcValue, ResponseCode};
use knx_session::TunnelingSession;
use log::{debug, warn};

impl KnxConnection {
    pub(super) async fn write_tag(&self, tunnel: &TunnelingSession, tag: &KnxTag, value: &PlcValue) -> ResponseCode {
        match tag {
            KnxTag::GroupAddress(tag) => match self.write_group(tunnel, tag, value).await {
                Ok(code) => code,
                Err(e) => {
                    debug!("Group write to {} failed: {}", tag.pattern, e);
                    e.response_code()
                }
            },
            KnxTag::DeviceProperty(_) | KnxTag::DeviceMemory(_) => ResponseCode::Unsupported,
        }
    }

    /// Send a GroupValueWrite and wait for the gateway to take it
    async fn write_group(&self, tunnel: &TunnelingSession, tag: &GroupAddressTag, value: &PlcValue) -> KnxResult<ResponseCode> {
        let group = tag
            .pattern
            .single_address()
            .ok_or_else(|| KnxError::InvalidAddress(format!("Cannot write to pattern {}", tag.pattern)))?;
        let datapoint_type = tag
            .datapoint_type
            .ok_or_else(|| KnxError::InvalidDatatype(format!("No datapoint type given for {}", tag.pattern)))?;
        let apdu = encode_group_write(self.codec.as_ref(), value, datapoint_type)?;

        let request = Cemi::LDataReq(LDataFrame::new(
            IndividualAddress::NULL,
            Destination::Group(group),
            Priority::Low,
            Apdu::data(apdu),
        ));
        let status = tunnel
            .request_tunneling_ack(request, self.config.request_timeout)
            .await?;
        if status.is_ok() {
            Ok(ResponseCode::Ok)
        } else {
            warn!("Gateway refused write to {} with {:?}", tag.pattern, status);
            Ok(ResponseCode::InternalError)
        }
    }
}
