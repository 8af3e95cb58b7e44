// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of acsedge.
//
// acsedge is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// acsedge is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with acsedge.  If not,
// see <http://www.gnu.org/licenses/>.

//! # CWMP envelopes
//!
//! TR-069 messages are SOAP envelopes riding on HTTP POSTs. The edge doesn't need the full RPC
//! vocabulary-- it needs to recognize an Inform (and pull the device identity & event codes out
//! of it), tell RPC responses from CPE-originated RPCs, and produce the handful of envelopes it
//! sends itself: InformResponse and fault envelopes. This module does exactly that much, and no
//! more; the parser is deliberately tolerant of whatever else a CPE puts in the envelope.

use std::fmt::Display;

use quick_xml::{events::Event, Reader};
use snafu::{prelude::*, Backtrace};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The envelope has no SOAP Body"))]
    NoBody { backtrace: Backtrace },
    #[snafu(display("The Inform is missing its DeviceId"))]
    NoDeviceId { backtrace: Backtrace },
    #[snafu(display("Failed to parse the envelope: {source}"))]
    Xml {
        source: quick_xml::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          fault codes                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// TR-069 fault codes: the 9000 range is defined by the protocol for CPE faults; the 8000 range
/// is the ACS-originated vocabulary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultCode {
    RequestDenied,
    Internal,
    InvalidArgs,
    ResourceExceeded,
    InvalidParameterName,
    InvalidParameterValue,
    DownloadFailure,
    UploadFailure,
    AcsMethodNotSupported,
    AcsRequestDenied,
    AcsInternalError,
    AcsInvalidArgs,
    AcsResourceExceeded,
    AcsRetry,
}

impl FaultCode {
    pub fn value(&self) -> u32 {
        match self {
            FaultCode::RequestDenied => 9001,
            FaultCode::Internal => 9002,
            FaultCode::InvalidArgs => 9003,
            FaultCode::ResourceExceeded => 9004,
            FaultCode::InvalidParameterName => 9005,
            FaultCode::InvalidParameterValue => 9007,
            FaultCode::DownloadFailure => 9010,
            FaultCode::UploadFailure => 9011,
            FaultCode::AcsMethodNotSupported => 8000,
            FaultCode::AcsRequestDenied => 8001,
            FaultCode::AcsInternalError => 8002,
            FaultCode::AcsInvalidArgs => 8003,
            FaultCode::AcsResourceExceeded => 8004,
            FaultCode::AcsRetry => 8005,
        }
    }
}

impl Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         CWMP versions                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The CWMP protocol revision, inferred from the envelope's `urn:dslforum-org:cwmp-1-x`
/// namespace. The CPE picks; we answer in kind.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CwmpVersion {
    V1_0,
    #[default]
    V1_1,
    V1_2,
}

impl CwmpVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            CwmpVersion::V1_0 => "urn:dslforum-org:cwmp-1-0",
            CwmpVersion::V1_1 => "urn:dslforum-org:cwmp-1-1",
            CwmpVersion::V1_2 => "urn:dslforum-org:cwmp-1-2",
        }
    }
    fn from_namespace(ns: &str) -> Option<CwmpVersion> {
        match ns {
            "urn:dslforum-org:cwmp-1-0" => Some(CwmpVersion::V1_0),
            "urn:dslforum-org:cwmp-1-1" => Some(CwmpVersion::V1_1),
            "urn:dslforum-org:cwmp-1-2" => Some(CwmpVersion::V1_2),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         CPE messages                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The device identity carried in an Inform.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceId {
    pub manufacturer: String,
    pub oui: String,
    pub product_class: String,
    pub serial_number: String,
}

/// An Inform, reduced to what the edge cares about.
#[derive(Clone, Debug)]
pub struct Inform {
    pub id: Option<String>,
    pub version: CwmpVersion,
    pub device_id: DeviceId,
    pub event_codes: Vec<String>,
}

impl Inform {
    /// "6 CONNECTION REQUEST" means this session was triggered by us.
    pub fn triggered_by_connection_request(&self) -> bool {
        self.event_codes
            .iter()
            .any(|code| code.starts_with("6 CONNECTION REQUEST"))
    }
}

/// One CWMP message as received from a CPE.
#[derive(Clone, Debug)]
pub enum CpeMessage {
    Inform(Inform),
    /// A response to an RPC we previously sent (GetParameterValuesResponse &c)
    Response { name: String, id: Option<String> },
    /// A fault returned for an RPC we previously sent
    Fault {
        id: Option<String>,
        code: Option<u32>,
        detail: String,
    },
    /// A CPE-originated RPC (TransferComplete, e.g.)
    Rpc { name: String, id: Option<String> },
}

/// Parse a (non-empty) POST body into a [CpeMessage].
pub fn parse(body: &str) -> Result<CpeMessage> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut version = CwmpVersion::default();
    let mut id: Option<String> = None;
    let mut body_elem: Option<String> = None;
    let mut device_id = DeviceId::default();
    let mut saw_device_id = false;
    let mut event_codes: Vec<String> = Vec::new();
    let mut fault_code: Option<u32> = None;
    let mut fault_string = String::new();

    loop {
        match reader.read_event().context(XmlSnafu)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "Envelope" {
                    // Sniff the CWMP revision off the Envelope's namespace declarations.
                    for attr in e.attributes().flatten() {
                        if let Some(v) =
                            CwmpVersion::from_namespace(&String::from_utf8_lossy(&attr.value))
                        {
                            version = v;
                        }
                    }
                }
                if body_elem.is_none() && stack.last().map(|s| s.as_str()) == Some("Body") {
                    body_elem = Some(name.clone());
                }
                if name == "DeviceId" {
                    saw_device_id = true;
                }
                stack.push(name);
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(t) => {
                let text = t.unescape().context(XmlSnafu)?.into_owned();
                let here = stack.last().map(|s| s.as_str()).unwrap_or("");
                let parent = if stack.len() > 1 {
                    stack[stack.len() - 2].as_str()
                } else {
                    ""
                };
                match (parent, here) {
                    ("Header", "ID") => id = Some(text),
                    ("DeviceId", "Manufacturer") => device_id.manufacturer = text,
                    ("DeviceId", "OUI") => device_id.oui = text,
                    ("DeviceId", "ProductClass") => device_id.product_class = text,
                    ("DeviceId", "SerialNumber") => device_id.serial_number = text,
                    ("EventStruct", "EventCode") => event_codes.push(text),
                    (_, "FaultCode") => fault_code = text.parse::<u32>().ok(),
                    (_, "FaultString") => fault_string = text,
                    _ => (),
                }
            }
            Event::Eof => break,
            _ => (),
        }
    }

    let name = body_elem.context(NoBodySnafu)?;
    match name.as_str() {
        "Inform" => {
            ensure!(saw_device_id && !device_id.oui.is_empty(), NoDeviceIdSnafu);
            Ok(CpeMessage::Inform(Inform {
                id,
                version,
                device_id,
                event_codes,
            }))
        }
        "Fault" => Ok(CpeMessage::Fault {
            id,
            code: fault_code,
            detail: fault_string,
        }),
        _ if name.ends_with("Response") => Ok(CpeMessage::Response { name, id }),
        _ => Ok(CpeMessage::Rpc { name, id }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       outbound envelopes                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The `SOAPAction` header value CWMP requires on every envelope-bearing response.
pub static SOAP_ACTION: &str = "";

/// The `Content-Type` for envelope-bearing responses.
pub static CONTENT_TYPE: &str = "text/xml; charset=utf-8";

fn header_block(id: &Option<String>) -> String {
    match id {
        Some(id) => format!(
            r#"<soapenv:Header><cwmp:ID soapenv:mustUnderstand="1">{}</cwmp:ID></soapenv:Header>"#,
            id
        ),
        None => String::new(),
    }
}

/// Render an InformResponse, echoing the CPE's message ID & protocol revision.
pub fn inform_response(id: &Option<String>, version: CwmpVersion) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="{}">{}<soapenv:Body><cwmp:InformResponse><MaxEnvelopes>1</MaxEnvelopes></cwmp:InformResponse></soapenv:Body></soapenv:Envelope>"#,
        version.namespace(),
        header_block(id)
    )
}

/// Render the empty acknowledgment for a CPE-originated RPC (`TransferComplete` ⇒
/// `TransferCompleteResponse`, &c).
pub fn rpc_response(name: &str, id: &Option<String>, version: CwmpVersion) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="{}">{}<soapenv:Body><cwmp:{}Response></cwmp:{}Response></soapenv:Body></soapenv:Envelope>"#,
        version.namespace(),
        header_block(id),
        name,
        name
    )
}

/// Render a CWMP fault envelope.
///
/// Protocol errors are answered with HTTP 200 and one of these-- *not* an HTTP error; the HTTP
/// layer is just transport here.
pub fn fault(id: &Option<String>, version: CwmpVersion, code: FaultCode, detail: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="{}">{}<soapenv:Body><soapenv:Fault><faultcode>Client</faultcode><faultstring>CWMP fault</faultstring><detail><cwmp:Fault><FaultCode>{}</FaultCode><FaultString>{}</FaultString></cwmp:Fault></detail></soapenv:Fault></soapenv:Body></soapenv:Envelope>"#,
        version.namespace(),
        header_block(id),
        code,
        detail
    )
}
