//! Receipt extraction from images via the vision completion service.
//!
//! One call per image: the fixed prompt below requests a JSON object with
//! the receipt schema and nothing else. Local vision models still wrap
//! output in code fences or prepend chatter, so the response goes through a
//! bounded repair pipeline before parsing:
//!
//! 1. strip code fences;
//! 2. strict parse;
//! 3. on failure: trim leading/trailing non-JSON text, balance braces once,
//!    parse again (no further attempts);
//! 4. coerce field types (locale-tolerant decimals accepting `.` and `,`,
//!    ISO-8601 dates with a `dd.mm.yyyy` fallback);
//! 5. classify confidence: `ok` / `partial` / `failed`.
//!
//! The extractor never writes to the store. On `failed` the caller rejects
//! the ingest with the checksum of the input bytes and the raw model output
//! attached for debugging.

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::completion::{CompletionClient, CompletionError};
use crate::models::{parse_instant, LineItemDraft, ReceiptDraft};

/// Fixed prompt sent to the vision model. The schema is included verbatim;
/// the model is instructed to emit JSON only.
pub const EXTRACTION_PROMPT: &str = r#"You are an expert at reading receipts and invoices.
Analyze this image of a receipt carefully and extract ALL visible information.

Respond ONLY with a valid JSON object in this EXACT format:
{
    "vendor_name": "name of the business",
    "date": "YYYY-MM-DD",
    "total": 123.45,
    "tax": 23.45,
    "currency": "EUR",
    "payment_method": "card/cash or null",
    "receipt_number": "printed receipt number or null",
    "category": "Restaurant/Groceries/Fuel/Office Supplies/Electronics/Other",
    "line_items": [
        {"description": "product name", "quantity": 1, "unit_price": 10.00, "total_price": 10.00, "vat_percent": 19.0}
    ]
}

RULES:
1. Numbers as decimals (12.50 not "12,50")
2. Date in ISO format YYYY-MM-DD
3. If a field is not readable, use null
4. The JSON must be valid - no comments!

IMPORTANT: Respond ONLY with the JSON object!"#;

/// Parse-confidence classification for an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Ok,
    Partial,
    Failed,
}

/// A successful (possibly partial) extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub draft: ReceiptDraft,
    pub confidence: Confidence,
    /// Raw model output, kept for debugging and the `raw_text` response field.
    pub raw: String,
}

#[derive(Debug)]
pub enum ExtractError {
    /// The completion service failed; fatal to the request.
    Upstream(CompletionError),
    /// The model responded but no receipt could be parsed out of it.
    Unparseable { checksum: String, raw: String },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Upstream(e) => write!(f, "vision completion failed: {}", e),
            ExtractError::Unparseable { checksum, .. } => {
                write!(f, "could not extract a receipt (input sha256 {})", checksum)
            }
        }
    }
}

impl std::error::Error for ExtractError {}

/// SHA-256 hex digest of the input bytes, reported on extraction failure.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Run one extraction: a single vision call, then parse/repair/coerce.
pub async fn extract_receipt(
    client: &CompletionClient,
    image: &[u8],
    _mime: &str,
) -> Result<Extraction, ExtractError> {
    use base64::Engine;
    let image_b64 = base64::engine::general_purpose::STANDARD.encode(image);

    let raw = client
        .vision(EXTRACTION_PROMPT, &image_b64)
        .await
        .map_err(ExtractError::Upstream)?;

    match parse_response(&raw) {
        Some((draft, confidence)) if confidence != Confidence::Failed => Ok(Extraction {
            draft,
            confidence,
            raw,
        }),
        _ => Err(ExtractError::Unparseable {
            checksum: checksum(image),
            raw,
        }),
    }
}

/// Parse a raw model response into a draft plus confidence. `None` when no
/// JSON object survives the repairs.
pub fn parse_response(raw: &str) -> Option<(ReceiptDraft, Confidence)> {
    let stripped = strip_fences(raw);

    let value = match serde_json::from_str::<serde_json::Value>(stripped.trim()) {
        Ok(v) => v,
        Err(_) => {
            let repaired = repair_json(&stripped)?;
            serde_json::from_str::<serde_json::Value>(&repaired).ok()?
        }
    };

    let obj = value.as_object()?;
    let draft = coerce(obj);
    let confidence = classify(&draft);
    Some((draft, confidence))
}

/// Remove markdown code fences (with or without a language tag).
fn strip_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest
            .strip_prefix("json")
            .unwrap_or(rest)
            .trim_start_matches(['\r', '\n']);
        let body = rest.strip_suffix("```").unwrap_or(rest);
        return body.trim().to_string();
    }
    trimmed.to_string()
}

/// Bounded repair: keep everything between the first `{` and the last `}`,
/// then balance unclosed braces once. One shot; no loops.
fn repair_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}');

    let mut candidate = match end {
        Some(end) if end > start => text[start..=end].to_string(),
        _ => text[start..].trim_end().to_string(),
    };

    let opens = candidate.matches('{').count();
    let closes = candidate.matches('}').count();
    if opens > closes {
        candidate.push_str(&"}".repeat(opens - closes));
    }

    Some(candidate)
}

/// Single coercion stage: dynamic JSON → typed draft. Tolerates numbers as
/// strings with either decimal separator; everything unreadable becomes
/// `None` and is judged by `classify`.
fn coerce(obj: &serde_json::Map<String, serde_json::Value>) -> ReceiptDraft {
    let items = obj
        .get("line_items")
        .or_else(|| obj.get("items"))
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(coerce_item).collect())
        .unwrap_or_default();

    ReceiptDraft {
        vendor: string_field(obj, "vendor_name")
            .or_else(|| string_field(obj, "vendor"))
            .unwrap_or_default(),
        date: string_field(obj, "date").filter(|s| parse_instant(s).is_some()),
        total: decimal_field(obj, "total"),
        tax: decimal_field(obj, "tax"),
        currency: string_field(obj, "currency"),
        category: string_field(obj, "category"),
        payment_method: string_field(obj, "payment_method"),
        receipt_number: string_field(obj, "receipt_number"),
        image_ref: None,
        items,
    }
}

fn coerce_item(value: &serde_json::Value) -> Option<LineItemDraft> {
    let obj = value.as_object()?;
    let description = string_field(obj, "description").or_else(|| string_field(obj, "desc"))?;
    Some(LineItemDraft {
        description,
        quantity: obj
            .get("quantity")
            .and_then(|q| q.as_i64())
            .filter(|q| *q > 0)
            .unwrap_or(1),
        unit_price: decimal_field(obj, "unit_price"),
        total: decimal_field(obj, "total_price")
            .or_else(|| decimal_field(obj, "total"))
            .or_else(|| decimal_field(obj, "amount")),
        vat_percent: obj
            .get("vat_percent")
            .or_else(|| obj.get("tax_rate"))
            .and_then(|v| v.as_f64()),
    })
}

fn string_field(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(String::from)
}

fn decimal_field(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<Decimal> {
    match obj.get(key)? {
        serde_json::Value::Number(n) => {
            Decimal::from_str_exact(&n.to_string()).ok().or_else(|| {
                n.as_f64()
                    .and_then(|f| Decimal::try_from(f).ok())
            })
        }
        serde_json::Value::String(s) => parse_decimal_lenient(s),
        _ => None,
    }
}

/// Locale-tolerant decimal parse: accepts both `.` and `,` separators, and
/// thousands grouping like `1.234,56` or `1,234.56`. Otherwise strict.
pub fn parse_decimal_lenient(s: &str) -> Option<Decimal> {
    let s = s.trim().trim_start_matches('€').trim_end_matches('€').trim();
    if s.is_empty() {
        return None;
    }

    let cleaned = match (s.rfind(','), s.rfind('.')) {
        // Both present: the rightmost is the decimal separator.
        (Some(c), Some(d)) if c > d => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(_), None) => s.replace(',', "."),
        _ => s.to_string(),
    };

    cleaned.parse().ok()
}

/// `ok` when vendor, total, and date all parsed; `partial` when the
/// required vendor and total are there but the date is not; else `failed`.
fn classify(draft: &ReceiptDraft) -> Confidence {
    let has_vendor = !draft.vendor.trim().is_empty();
    let has_total = draft.total.is_some();

    if !has_vendor || !has_total {
        return Confidence::Failed;
    }
    if draft.date.is_some() {
        Confidence::Ok
    } else {
        Confidence::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    const CLEAN: &str = r#"{
        "vendor_name": "REWE",
        "date": "2024-01-15",
        "total": 45.67,
        "tax": 7.32,
        "currency": "EUR",
        "line_items": [
            {"description": "Brot", "quantity": 1, "unit_price": 2.99, "total_price": 2.99}
        ]
    }"#;

    #[test]
    fn clean_json_parses_ok() {
        let (draft, confidence) = parse_response(CLEAN).unwrap();
        assert_eq!(confidence, Confidence::Ok);
        assert_eq!(draft.vendor, "REWE");
        assert_eq!(draft.total, Some(dec("45.67")));
        assert_eq!(draft.items.len(), 1);
    }

    #[test]
    fn fenced_json_parses() {
        let fenced = format!("```json\n{}\n```", CLEAN);
        let (draft, confidence) = parse_response(&fenced).unwrap();
        assert_eq!(confidence, Confidence::Ok);
        assert_eq!(draft.vendor, "REWE");
    }

    #[test]
    fn chatter_around_json_is_trimmed() {
        let noisy = format!("Here is the extracted receipt:\n{}\nHope this helps!", CLEAN);
        let (draft, _) = parse_response(&noisy).unwrap();
        assert_eq!(draft.vendor, "REWE");
    }

    #[test]
    fn unclosed_brace_is_balanced_once() {
        let truncated = r#"{"vendor_name": "REWE", "total": 12.00, "date": "2024-01-15""#;
        let (draft, confidence) = parse_response(truncated).unwrap();
        assert_eq!(draft.vendor, "REWE");
        assert_eq!(confidence, Confidence::Ok);
    }

    #[test]
    fn plain_prose_fails() {
        assert!(parse_response("I could not read this image, sorry.").is_none());
    }

    #[test]
    fn missing_total_classifies_failed() {
        let raw = r#"{"vendor_name": "REWE", "date": "2024-01-15"}"#;
        let (_, confidence) = parse_response(raw).unwrap();
        assert_eq!(confidence, Confidence::Failed);
    }

    #[test]
    fn missing_date_classifies_partial() {
        let raw = r#"{"vendor_name": "REWE", "total": "12,50"}"#;
        let (draft, confidence) = parse_response(raw).unwrap();
        assert_eq!(confidence, Confidence::Partial);
        assert_eq!(draft.total, Some(dec("12.50")));
    }

    #[test]
    fn lenient_decimals() {
        assert_eq!(parse_decimal_lenient("12.50"), Some(dec("12.50")));
        assert_eq!(parse_decimal_lenient("12,50"), Some(dec("12.50")));
        assert_eq!(parse_decimal_lenient("1.234,56"), Some(dec("1234.56")));
        assert_eq!(parse_decimal_lenient("1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_decimal_lenient("€ 9,99"), Some(dec("9.99")));
        assert_eq!(parse_decimal_lenient("abc"), None);
        assert_eq!(parse_decimal_lenient(""), None);
    }

    #[test]
    fn german_date_fallback_is_kept() {
        let raw = r#"{"vendor_name": "REWE", "total": 5.00, "date": "15.01.2024"}"#;
        let (draft, confidence) = parse_response(raw).unwrap();
        assert_eq!(confidence, Confidence::Ok);
        assert_eq!(draft.date.as_deref(), Some("15.01.2024"));
    }

    #[test]
    fn unreadable_date_becomes_none() {
        let raw = r#"{"vendor_name": "REWE", "total": 5.00, "date": "unknown"}"#;
        let (draft, confidence) = parse_response(raw).unwrap();
        assert!(draft.date.is_none());
        assert_eq!(confidence, Confidence::Partial);
    }

    #[test]
    fn checksum_is_stable_hex() {
        let a = checksum(b"hello");
        let b = checksum(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
