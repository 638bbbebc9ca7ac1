//! Responses

// Imports
use serde_json::Value;

/// Response envelope.
///
/// Every object the monitor sends is one of these, distinguished by shape.
#[derive(Clone, Debug)]
pub enum Response {
	/// Success, with the (possibly empty) payload
	Success { id: Option<u64>, payload: Value },

	/// Error
	Error { id: Option<u64>, class: String, desc: String },

	/// Asynchronous event
	Event(Event),

	/// Greeting, sent once on connection
	Greeting(Value),
}

impl Response {
	/// Decodes a response from a single json document.
	///
	/// Documents that aren't json are a decoding error, but json that doesn't
	/// match any known envelope is classified as an error envelope.
	pub fn decode(document: &str) -> Result<Self, serde_json::Error> {
		let value = serde_json::from_str::<Value>(document)?;
		let Value::Object(mut obj) = value else {
			return Ok(Self::Error {
				id:    None,
				class: "InvalidEnvelope".to_owned(),
				desc:  document.to_owned(),
			});
		};
		let id = obj.get("id").and_then(Value::as_u64);

		if let Some(payload) = obj.remove("return") {
			return Ok(Self::Success { id, payload });
		}

		if obj.contains_key("event") && obj.contains_key("timestamp") {
			let event = serde_json::from_value::<Event>(Value::Object(obj))?;
			return Ok(Self::Event(event));
		}

		if let Some(greeting) = obj.remove("QMP") {
			return Ok(Self::Greeting(greeting));
		}

		let (class, desc) = match obj.get("error") {
			Some(error) => (
				error.get("class").and_then(Value::as_str).unwrap_or("GenericError").to_owned(),
				error
					.get("desc")
					.and_then(Value::as_str)
					.map_or_else(|| error.to_string(), str::to_owned),
			),
			None => ("InvalidEnvelope".to_owned(), document.to_owned()),
		};

		Ok(Self::Error { id, class, desc })
	}

	/// Returns the request id this response answers, if any.
	///
	/// Events and greetings never answer a request.
	pub fn id(&self) -> Option<u64> {
		match *self {
			Self::Success { id, .. } | Self::Error { id, .. } => id,
			Self::Event(_) | Self::Greeting(_) => None,
		}
	}
}

/// Event
#[derive(Clone, Debug)]
#[derive(serde::Deserialize)]
pub struct Event {
	/// Name
	#[serde(rename = "event")]
	pub name: String,

	/// Time the event was emitted
	pub timestamp: Timestamp,

	/// Event data
	#[serde(default)]
	pub data: Option<Value>,
}

/// Event timestamp
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Deserialize)]
pub struct Timestamp {
	pub seconds:      i64,
	pub microseconds: i64,
}

#[cfg(test)]
mod tests {
	use {super::*, serde_json::json};

	#[test]
	fn classify_success() {
		let resp = Response::decode(r#"{"return": {}, "id": 3}"#).expect("Unable to decode");
		assert!(matches!(resp, Response::Success { id: Some(3), ref payload } if *payload == json!({})));
	}

	#[test]
	fn classify_success_with_payload() {
		let resp = Response::decode(r#"{"return": [{"start": 0, "end": 655360}]}"#).expect("Unable to decode");
		match resp {
			Response::Success { id, payload } => {
				assert_eq!(id, None);
				assert_eq!(payload, json!([{ "start": 0, "end": 655360 }]));
			},
			resp => panic!("Expected success, found {resp:?}"),
		}
	}

	#[test]
	fn classify_error() {
		let resp = Response::decode(r#"{"error": {"class": "CommandNotFound", "desc": "The command foo has not been found"}, "id": 1}"#)
			.expect("Unable to decode");
		match resp {
			Response::Error { id, class, desc } => {
				assert_eq!(id, Some(1));
				assert_eq!(class, "CommandNotFound");
				assert_eq!(desc, "The command foo has not been found");
			},
			resp => panic!("Expected error, found {resp:?}"),
		}
	}

	#[test]
	fn classify_event() {
		let resp = Response::decode(r#"{"timestamp": {"seconds": 1267040730, "microseconds": 682951}, "event": "STOP"}"#)
			.expect("Unable to decode");
		match resp {
			Response::Event(event) => {
				assert_eq!(event.name, "STOP");
				assert_eq!(event.timestamp, Timestamp {
					seconds:      1267040730,
					microseconds: 682951,
				});
				assert!(event.data.is_none());
			},
			resp => panic!("Expected event, found {resp:?}"),
		}
	}

	#[test]
	fn classify_greeting() {
		let resp = Response::decode(r#"{"QMP": {"version": {"qemu": {"major": 8}}, "capabilities": []}}"#)
			.expect("Unable to decode");
		assert!(matches!(resp, Response::Greeting(_)));
		assert_eq!(resp.id(), None);
	}

	#[test]
	fn unknown_shapes_are_errors() {
		assert!(matches!(
			Response::decode(r#"{"something": 1}"#).expect("Unable to decode"),
			Response::Error { ref class, .. } if class == "InvalidEnvelope"
		));
		assert!(matches!(
			Response::decode("[1, 2]").expect("Unable to decode"),
			Response::Error { .. }
		));
	}

	#[test]
	fn non_json_fails_to_decode() {
		assert!(Response::decode("not json").is_err());
	}
}
