//! First-datagram piggyback carried in the SDP session-information (`i=`)
//! line, plus the origin username that names the offering side.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use rtc_signaling::SdpPayload;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::sdp::description::session::SessionDescription;

use crate::error::{BindError, BindResult};

fn parse(payload: &SdpPayload) -> BindResult<SessionDescription> {
    let mut reader = Cursor::new(payload.sdp.as_bytes());
    SessionDescription::unmarshal(&mut reader)
        .map_err(|err| BindError::Piggyback(format!("unparsable sdp: {err}")))
}

/// Stamps `origin` as the SDP origin username and embeds `piggyback` as the
/// session information.
pub(crate) fn attach(payload: &SdpPayload, origin: &str, piggyback: &[u8]) -> BindResult<SdpPayload> {
    let mut description = parse(payload)?;
    if !origin.is_empty() {
        description.origin.username = origin.to_string();
    }
    description.session_information = Some(STANDARD.encode(piggyback));
    Ok(SdpPayload {
        sdp: description.marshal(),
        typ: payload.typ.clone(),
    })
}

fn extract(payload: &SdpPayload) -> BindResult<Option<Bytes>> {
    let description = parse(payload)?;
    let Some(encoded) = description.session_information else {
        return Ok(None);
    };
    STANDARD
        .decode(encoded.trim())
        .map(|raw| Some(Bytes::from(raw)))
        .map_err(|err| BindError::Piggyback(format!("session information is not base64: {err}")))
}

/// Decodes the initiator an offer must carry.
pub fn extract_initiator(offer: &SdpPayload) -> BindResult<Bytes> {
    extract(offer)?.ok_or(BindError::InitiatorRequired)
}

/// Decodes the responder an answer must carry.
pub fn extract_responder(answer: &SdpPayload) -> BindResult<Bytes> {
    extract(answer)?.ok_or(BindError::ResponderRequired)
}

/// Origin username of an offer; `-` and empty mean anonymous.
pub(crate) fn origin_of(payload: &SdpPayload) -> BindResult<Option<String>> {
    let username = parse(payload)?.origin.username;
    if username.is_empty() || username == "-" {
        Ok(None)
    } else {
        Ok(Some(username))
    }
}

pub(crate) fn payload_from_description(desc: &RTCSessionDescription) -> SdpPayload {
    SdpPayload {
        sdp: desc.sdp.clone(),
        typ: desc.sdp_type.to_string(),
    }
}

pub(crate) fn session_description_from_payload(
    payload: &SdpPayload,
) -> BindResult<RTCSessionDescription> {
    let description = match RTCSdpType::from(payload.typ.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(payload.sdp.clone()),
        RTCSdpType::Answer => RTCSessionDescription::answer(payload.sdp.clone()),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(payload.sdp.clone()),
        RTCSdpType::Rollback | RTCSdpType::Unspecified => {
            return Err(BindError::Setup(format!(
                "unsupported sdp type {}",
                payload.typ
            )));
        }
    };
    description.map_err(|err| BindError::Setup(err.to_string()))
}
