//! Wire types shared by the access point and relay protocols.
//!
//! * [`protos`] - protocol buffer messages generated at build time
//!
//! JSON bodies from HTTP services and relay frames go through [`json`], which
//! logs what was received so that protocol changes on the service side show
//! up in trace output.

pub mod protos;

use std::fmt::Debug;

use serde::Deserialize;

use crate::error::Result;

/// Parses a JSON body and logs it.
///
/// Successfully parsed values are logged at TRACE level. When parsing fails
/// but the body is valid JSON, the raw value is logged at TRACE level so the
/// mismatch can be inspected; otherwise the failure is logged at ERROR level.
///
/// # Errors
///
/// Returns `DataLoss` when the body is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
