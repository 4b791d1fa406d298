//! `changes` / `proposeChanges` bodies and their positional responses.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::Value as Json;

/// One entry of a `changes` message:
/// `[sequence, docID, revID, deleted?, bodySize?]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesEntry {
    /// The sender's sequence for this change (opaque to the receiver).
    pub sequence: Json,
    /// Document ID.
    pub doc_id: String,
    /// Revision ID, in wire form.
    pub rev_id: String,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// Size of the revision body, if known.
    pub body_size: u64,
}

impl ChangesEntry {
    /// Encodes to the wire array form. Trailing defaults are omitted.
    pub fn to_json(&self) -> Json {
        let mut entry = vec![
            self.sequence.clone(),
            Json::from(self.doc_id.clone()),
            Json::from(self.rev_id.clone()),
        ];
        if self.deleted || self.body_size > 0 {
            entry.push(Json::from(u8::from(self.deleted)));
        }
        if self.body_size > 0 {
            entry.push(Json::from(self.body_size));
        }
        Json::Array(entry)
    }

    /// Decodes one wire entry.
    pub fn from_json(index: usize, json: &Json) -> ProtocolResult<Self> {
        let entry = json
            .as_array()
            .ok_or_else(|| ProtocolError::invalid_entry(index, "expected array"))?;
        if entry.len() < 3 {
            return Err(ProtocolError::invalid_entry(index, "too few fields"));
        }
        let doc_id = entry[1]
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_entry(index, "docID must be a string"))?;
        let rev_id = entry[2]
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_entry(index, "revID must be a string"))?;
        Ok(Self {
            sequence: entry[0].clone(),
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            deleted: entry.get(3).and_then(Json::as_u64).unwrap_or(0) != 0,
            body_size: entry.get(4).and_then(Json::as_u64).unwrap_or(0),
        })
    }
}

/// One entry of a `proposeChanges` message:
/// `[docID, revID, parentRevID?, bodySize?]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedEntry {
    /// Document ID.
    pub doc_id: String,
    /// Proposed revision ID, in wire form.
    pub rev_id: String,
    /// The revision the sender believes the receiver currently has.
    pub parent_rev_id: Option<String>,
    /// Size of the revision body, if known.
    pub body_size: u64,
}

impl ProposedEntry {
    /// Encodes to the wire array form.
    pub fn to_json(&self) -> Json {
        let mut entry = vec![
            Json::from(self.doc_id.clone()),
            Json::from(self.rev_id.clone()),
        ];
        if self.parent_rev_id.is_some() || self.body_size > 0 {
            entry.push(match &self.parent_rev_id {
                Some(parent) => Json::from(parent.clone()),
                None => Json::from(""),
            });
        }
        if self.body_size > 0 {
            entry.push(Json::from(self.body_size));
        }
        Json::Array(entry)
    }

    /// Decodes one wire entry.
    pub fn from_json(index: usize, json: &Json) -> ProtocolResult<Self> {
        let entry = json
            .as_array()
            .ok_or_else(|| ProtocolError::invalid_entry(index, "expected array"))?;
        if entry.len() < 2 {
            return Err(ProtocolError::invalid_entry(index, "too few fields"));
        }
        let doc_id = entry[0]
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_entry(index, "docID must be a string"))?;
        let rev_id = entry[1]
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_entry(index, "revID must be a string"))?;
        let parent = entry
            .get(2)
            .and_then(Json::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(Self {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            parent_rev_id: parent,
            body_size: entry.get(3).and_then(Json::as_u64).unwrap_or(0),
        })
    }
}

/// One positional answer in a changes response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAnswer {
    /// `0`: the revision is not wanted (already present, or no opinion).
    NotWanted,
    /// A positive status code: the entry is rejected (`409` conflict, etc).
    Status(u16),
    /// The revision is wanted; the array lists ancestor revIDs the
    /// responder already has (possibly empty).
    Ancestors(Vec<String>),
}

/// Writes a positional changes response.
///
/// Only slots through the last non-zero answer are emitted; the peer
/// interprets missing trailing slots as zeros. Leading zero-fill between
/// non-zero answers is written as raw `0,` runs so positional
/// correspondence is kept at minimal cost.
#[derive(Debug, Default)]
pub struct ChangesResponseWriter {
    out: String,
    items_written: usize,
    next_index: usize,
}

impl ChangesResponseWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the answer for the next entry.
    pub fn push(&mut self, answer: &ResponseAnswer) {
        let index = self.next_index;
        self.next_index += 1;
        if matches!(answer, ResponseAnswer::NotWanted) {
            // Implied by a trailing gap; zero-filled later if needed.
            return;
        }
        if self.items_written > 0 {
            self.out.push(',');
        }
        while self.items_written < index {
            self.out.push_str("0,");
            self.items_written += 1;
        }
        self.items_written += 1;
        match answer {
            ResponseAnswer::NotWanted => unreachable!(),
            ResponseAnswer::Status(code) => {
                self.out.push_str(&code.to_string());
            }
            ResponseAnswer::Ancestors(revs) => {
                let json = Json::Array(revs.iter().cloned().map(Json::from).collect());
                self.out.push_str(&json.to_string());
            }
        }
    }

    /// Finishes the response, returning the JSON body text.
    pub fn finish(self) -> String {
        format!("[{}]", self.out)
    }
}

/// A parsed positional changes response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesResponse {
    /// One answer per request entry, trailing zeros expanded.
    pub answers: Vec<ResponseAnswer>,
}

impl ChangesResponse {
    /// Parses a response body against a request of `n_entries` entries.
    ///
    /// A `null` body means "nothing wanted". The response may have at most
    /// `n_entries` slots; missing trailing slots are zeros.
    pub fn parse(body: &Json, n_entries: usize) -> ProtocolResult<Self> {
        let slots: &[Json] = match body {
            Json::Null => &[],
            Json::Array(slots) => slots,
            _ => return Err(ProtocolError::invalid_body("expected array or null")),
        };
        if slots.len() > n_entries {
            return Err(ProtocolError::invalid_body(format!(
                "{} answers for {} entries",
                slots.len(),
                n_entries
            )));
        }
        let mut answers = Vec::with_capacity(n_entries);
        for (index, slot) in slots.iter().enumerate() {
            answers.push(match slot {
                Json::Number(n) => {
                    let code = n
                        .as_u64()
                        .ok_or_else(|| ProtocolError::invalid_entry(index, "negative status"))?;
                    if code == 0 {
                        ResponseAnswer::NotWanted
                    } else {
                        let code = u16::try_from(code).map_err(|_| {
                            ProtocolError::invalid_entry(index, "status out of range")
                        })?;
                        ResponseAnswer::Status(code)
                    }
                }
                Json::Array(revs) => {
                    let mut ancestors = Vec::with_capacity(revs.len());
                    for rev in revs {
                        let rev = rev.as_str().ok_or_else(|| {
                            ProtocolError::invalid_entry(index, "ancestor must be a string")
                        })?;
                        ancestors.push(rev.to_string());
                    }
                    ResponseAnswer::Ancestors(ancestors)
                }
                _ => return Err(ProtocolError::invalid_entry(index, "unexpected answer type")),
            });
        }
        answers.resize(n_entries, ResponseAnswer::NotWanted);
        Ok(Self { answers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn changes_entry_roundtrip() {
        let entry = ChangesEntry {
            sequence: json!(7),
            doc_id: "d1".to_string(),
            rev_id: "2-ab".to_string(),
            deleted: true,
            body_size: 42,
        };
        let wire = entry.to_json();
        assert_eq!(wire, json!([7, "d1", "2-ab", 1, 42]));
        assert_eq!(ChangesEntry::from_json(0, &wire).unwrap(), entry);
    }

    #[test]
    fn changes_entry_omits_trailing_defaults() {
        let entry = ChangesEntry {
            sequence: json!(1),
            doc_id: "d".to_string(),
            rev_id: "1-a".to_string(),
            deleted: false,
            body_size: 0,
        };
        assert_eq!(entry.to_json(), json!([1, "d", "1-a"]));
    }

    #[test]
    fn proposed_entry_roundtrip() {
        let entry = ProposedEntry {
            doc_id: "d1".to_string(),
            rev_id: "2-cc".to_string(),
            parent_rev_id: Some("1-aa".to_string()),
            body_size: 10,
        };
        let wire = entry.to_json();
        assert_eq!(wire, json!(["d1", "2-cc", "1-aa", 10]));
        assert_eq!(ProposedEntry::from_json(0, &wire).unwrap(), entry);
    }

    #[test]
    fn proposed_entry_without_parent() {
        let wire = json!(["d1", "1-aa"]);
        let entry = ProposedEntry::from_json(0, &wire).unwrap();
        assert_eq!(entry.parent_rev_id, None);
        // An empty-string parent also means "no parent".
        let wire = json!(["d1", "1-aa", "", 5]);
        let entry = ProposedEntry::from_json(0, &wire).unwrap();
        assert_eq!(entry.parent_rev_id, None);
        assert_eq!(entry.body_size, 5);
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(ChangesEntry::from_json(0, &json!("nope")).is_err());
        assert!(ChangesEntry::from_json(0, &json!([1, "d"])).is_err());
        assert!(ChangesEntry::from_json(0, &json!([1, 2, "1-a"])).is_err());
        assert!(ProposedEntry::from_json(0, &json!(["d"])).is_err());
    }

    #[test]
    fn writer_skips_trailing_zeros() {
        let mut writer = ChangesResponseWriter::new();
        writer.push(&ResponseAnswer::Ancestors(vec![]));
        writer.push(&ResponseAnswer::NotWanted);
        writer.push(&ResponseAnswer::NotWanted);
        assert_eq!(writer.finish(), "[[]]");
    }

    #[test]
    fn writer_zero_fills_gaps() {
        let mut writer = ChangesResponseWriter::new();
        writer.push(&ResponseAnswer::NotWanted);
        writer.push(&ResponseAnswer::NotWanted);
        writer.push(&ResponseAnswer::Status(409));
        writer.push(&ResponseAnswer::Ancestors(vec!["1-a".to_string()]));
        assert_eq!(writer.finish(), r#"[0,0,409,["1-a"]]"#);
    }

    #[test]
    fn writer_all_zeros_is_empty_array() {
        let mut writer = ChangesResponseWriter::new();
        writer.push(&ResponseAnswer::NotWanted);
        writer.push(&ResponseAnswer::NotWanted);
        assert_eq!(writer.finish(), "[]");
    }

    #[test]
    fn parse_expands_trailing_zeros() {
        let parsed = ChangesResponse::parse(&json!([[], 409]), 4).unwrap();
        assert_eq!(
            parsed.answers,
            vec![
                ResponseAnswer::Ancestors(vec![]),
                ResponseAnswer::Status(409),
                ResponseAnswer::NotWanted,
                ResponseAnswer::NotWanted,
            ]
        );
    }

    #[test]
    fn parse_null_body_means_nothing_wanted() {
        let parsed = ChangesResponse::parse(&Json::Null, 2).unwrap();
        assert_eq!(parsed.answers.len(), 2);
        assert!(parsed
            .answers
            .iter()
            .all(|a| matches!(a, ResponseAnswer::NotWanted)));
    }

    #[test]
    fn parse_rejects_excess_slots() {
        assert!(ChangesResponse::parse(&json!([0, 0, 0]), 2).is_err());
    }

    #[test]
    fn writer_and_parser_agree() {
        let answers = vec![
            ResponseAnswer::NotWanted,
            ResponseAnswer::Ancestors(vec!["2-b".to_string(), "1-a".to_string()]),
            ResponseAnswer::Status(304),
            ResponseAnswer::NotWanted,
        ];
        let mut writer = ChangesResponseWriter::new();
        for answer in &answers {
            writer.push(answer);
        }
        let body: Json = serde_json::from_str(&writer.finish()).unwrap();
        let parsed = ChangesResponse::parse(&body, answers.len()).unwrap();
        assert_eq!(parsed.answers, answers);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn answer_strategy() -> impl Strategy<Value = ResponseAnswer> {
            prop_oneof![
                Just(ResponseAnswer::NotWanted),
                (1u16..1000).prop_map(ResponseAnswer::Status),
                proptest::collection::vec("[1-9]-[0-9a-f]{4}", 0..4)
                    .prop_map(ResponseAnswer::Ancestors),
            ]
        }

        proptest! {
            #[test]
            fn any_response_roundtrips(
                answers in proptest::collection::vec(answer_strategy(), 0..12)
            ) {
                let mut writer = ChangesResponseWriter::new();
                for answer in &answers {
                    writer.push(answer);
                }
                let body: Json = serde_json::from_str(&writer.finish()).unwrap();
                let parsed = ChangesResponse::parse(&body, answers.len()).unwrap();
                prop_assert_eq!(parsed.answers, answers);
            }
        }
    }
}
