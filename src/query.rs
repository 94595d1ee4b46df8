//! The query planner: natural-language questions over the receipt ledger.
//!
//! The planner is a hybrid: classification and all arithmetic are
//! deterministic, only the final prose comes from the language model.
//!
//! 1. **Classify** the question into an intent by rule-based keyword
//!    matching (bilingual lexicon, German and English), first matching
//!    entry wins, in the fixed order `sum_by_category`, `sum_by_vendor`,
//!    `sum_by_period`, `count`, `list_top_k`, `find_specific`, `freeform`.
//! 2. **Retrieve candidates**: embed the question, vector-search with
//!    k = 20, intersect with the extracted structured filters.
//! 3. **Aggregate deterministically** over the relational store for every
//!    intent except `freeform`. The vector result only selects the
//!    source-receipt list for display (top 5 by similarity within the
//!    aggregation's domain).
//! 4. **Prompt** the text completion service with a constrained system
//!    prompt; the model restates the numbers, it never computes them. When
//!    the service is offline the deterministic numbers are still returned
//!    with a templated prose fallback.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;

use crate::audit::{matches_watchlist, SUSPICIOUS_CATEGORIES};
use crate::completion::{ChatMessage, CompletionClient, CompletionError};
use crate::embedding::Embedder;
use crate::extract::parse_decimal_lenient;
use crate::models::{cents_to_string, to_cents, Receipt};
use crate::store::{ListFilter, ReceiptStore};
use crate::vector::{Metadata, VectorIndex};

/// Prose returned when the language service cannot be reached; the
/// deterministic numbers are unaffected.
pub const OFFLINE_PROSE: &str =
    "Totals computed; prose unavailable because the language service is offline.";

const SYSTEM_PROMPT: &str = "You are the assistant of a small-business bookkeeping system. \
You may only restate the provided numbers; you may not compute new ones. \
Answer the user's question in one or two plain sentences using exactly the \
amounts, counts, and receipts given in the context block.";

const CANDIDATE_K: usize = 20;
const SOURCE_LIMIT: usize = 5;
const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    SumByCategory,
    SumByVendor,
    SumByPeriod,
    Count,
    ListTopK,
    FindSpecific,
    Freeform,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::SumByCategory => "sum_by_category",
            Intent::SumByVendor => "sum_by_vendor",
            Intent::SumByPeriod => "sum_by_period",
            Intent::Count => "count",
            Intent::ListTopK => "list_top_k",
            Intent::FindSpecific => "find_specific",
            Intent::Freeform => "freeform",
        }
    }
}

/// Structured filters pulled out of the question text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters {
    /// Canonical category name (lexicon output, e.g. `"Groceries"`).
    pub category: Option<String>,
    /// Normalized vendor name present in the store.
    pub vendor: Option<String>,
    pub day_from: Option<NaiveDate>,
    pub day_to: Option<NaiveDate>,
    pub min_cents: Option<i64>,
    pub max_cents: Option<i64>,
    pub top_k: Option<usize>,
}

/// The answer record: prose plus the deterministic result it restates.
#[derive(Debug, Clone)]
pub struct Answer {
    pub intent: Intent,
    pub answer: String,
    /// Minor units; `None` for freeform answers.
    pub total_cents: Option<i64>,
    pub count: i64,
    pub receipt_ids: Vec<i64>,
    pub receipts: Vec<Receipt>,
}

/// Reply of the prose-only chat path.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub response: String,
    pub sources_used: usize,
}

/// One user/assistant turn of chat history.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

// ============ Lexicon ============
// Bilingual (German + English), matched against the lowercased question.

const SUM_KEYWORDS: &[&str] = &[
    "how much", "total", "sum", "spend", "spent", "wie viel", "wieviel", "ausgegeben", "summe",
    "gesamt", "kosten", "umsatz",
];

const COUNT_KEYWORDS: &[&str] = &["how many", "count", "number of", "wie viele", "anzahl"];

const TOP_KEYWORDS: &[&str] = &[
    "top", "largest", "biggest", "most expensive", "highest", "teuerste", "größte", "groesste",
];

const FIND_KEYWORDS: &[&str] = &[
    "show", "find", "list", "search", "which", "zeige", "zeig", "finde", "suche", "welche",
];

/// Question token → canonical category. Watchlist categories resolve to
/// their lowercase names and trigger the suspicious-line aggregation.
const CATEGORY_LEXICON: &[(&str, &str)] = &[
    ("alcohol", "alcohol"),
    ("alkohol", "alcohol"),
    ("tobacco", "tobacco"),
    ("tabak", "tobacco"),
    ("bar", "bar"),
    ("electronics", "Electronics"),
    ("elektronik", "Electronics"),
    ("hardware", "Hardware"),
    ("software", "Software"),
    ("travel", "Travel"),
    ("reise", "Travel"),
    ("reisen", "Travel"),
    ("meals", "Meals"),
    ("essen", "Meals"),
    ("restaurant", "Restaurant"),
    ("groceries", "Groceries"),
    ("lebensmittel", "Groceries"),
    ("einkauf", "Groceries"),
    ("fuel", "Fuel"),
    ("kraftstoff", "Fuel"),
    ("tanken", "Fuel"),
    ("benzin", "Fuel"),
    ("gas", "Fuel"),
    ("office", "Office Supplies"),
    ("büro", "Office Supplies"),
    ("buero", "Office Supplies"),
];

pub struct QueryPlanner {
    store: ReceiptStore,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    completion: Arc<CompletionClient>,
    currency: String,
}

impl QueryPlanner {
    pub fn new(
        store: ReceiptStore,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        completion: Arc<CompletionClient>,
        currency: String,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            completion,
            currency,
        }
    }

    /// Answer a free-form business question.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let vendors = self.store.distinct_vendors().await?;
        let vendor_norms: Vec<&str> = vendors.iter().map(|(norm, _)| norm.as_str()).collect();
        let (intent, filters) = classify(question, &vendor_norms, Utc::now().date_naive());
        debug!(intent = intent.as_str(), ?filters, "classified question");

        // Candidate retrieval: vector search plus the structured filter.
        let query_vec = self.embedder.embed(question).await.unwrap_or_default();
        let mut meta_filter = Metadata::new();
        if let Some(vendor) = &filters.vendor {
            meta_filter.insert("vendor".to_string(), vendor.clone());
        }
        if let Some(category) = &filters.category {
            if !is_watch_category(category) {
                meta_filter.insert("category".to_string(), category.to_lowercase());
            }
        }
        let hits = self
            .index
            .search(&query_vec, CANDIDATE_K, &meta_filter)
            .await
            .unwrap_or_default();

        if intent == Intent::Freeform {
            return self.answer_freeform(question, &hits).await;
        }

        // Deterministic aggregation over the store, never over the hits.
        let domain = self.store.list(&domain_filter(intent, &filters)).await?;
        let (total_cents, count, domain_receipts) =
            aggregate(intent, &filters, domain);

        if count == 0 {
            return Ok(Answer {
                intent,
                answer: "No matching receipts.".to_string(),
                total_cents: Some(0),
                count: 0,
                receipt_ids: Vec::new(),
                receipts: Vec::new(),
            });
        }

        // Source list: top-5 by similarity, filtered to the aggregation's
        // domain; equal similarities by timestamp then id, both descending.
        let by_id: HashMap<i64, &Receipt> =
            domain_receipts.iter().map(|r| (r.id, r)).collect();
        let mut sources: Vec<(f32, &Receipt)> = hits
            .iter()
            .filter_map(|h| by_id.get(&h.id).map(|r| (h.similarity, *r)))
            .collect();
        sources.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.date.cmp(&a.1.date))
                .then(b.1.id.cmp(&a.1.id))
        });
        sources.truncate(SOURCE_LIMIT);

        let receipts: Vec<Receipt> = sources.iter().map(|(_, r)| (*r).clone()).collect();
        let receipt_ids: Vec<i64> = receipts.iter().map(|r| r.id).collect();

        let prose = self
            .formulate(question, intent, Some(total_cents), count, &receipts)
            .await;

        Ok(Answer {
            intent,
            answer: prose,
            total_cents: Some(total_cents),
            count,
            receipt_ids,
            receipts,
        })
    }

    async fn answer_freeform(
        &self,
        question: &str,
        hits: &[crate::vector::SearchHit],
    ) -> Result<Answer> {
        let mut receipts = Vec::new();
        for hit in hits.iter().take(SOURCE_LIMIT) {
            if let Some(receipt) = self.store.get(hit.id).await? {
                receipts.push(receipt);
            }
        }

        if receipts.is_empty() {
            return Ok(Answer {
                intent: Intent::Freeform,
                answer: "No matching receipts.".to_string(),
                total_cents: Some(0),
                count: 0,
                receipt_ids: Vec::new(),
                receipts: Vec::new(),
            });
        }

        let receipt_ids: Vec<i64> = receipts.iter().map(|r| r.id).collect();
        let count = receipts.len() as i64;
        let prose = self
            .formulate(question, Intent::Freeform, None, count, &receipts)
            .await;

        Ok(Answer {
            intent: Intent::Freeform,
            answer: prose,
            total_cents: None,
            count,
            receipt_ids,
            receipts,
        })
    }

    /// Ask the completion service to phrase the answer. Degrades to the
    /// offline template; the numbers are already final.
    async fn formulate(
        &self,
        question: &str,
        intent: Intent,
        total_cents: Option<i64>,
        count: i64,
        sources: &[Receipt],
    ) -> String {
        let context = context_block(intent, total_cents, count, sources, &self.currency);
        let messages = vec![
            ChatMessage::system(format!("{}\n\n{}", SYSTEM_PROMPT, context)),
            ChatMessage::user(question.to_string()),
        ];

        match self.completion.text(&messages).await {
            Ok(prose) => prose.trim().to_string(),
            Err(CompletionError::Api(e)) => {
                debug!(error = %e, "completion service rejected the prompt");
                OFFLINE_PROSE.to_string()
            }
            Err(e) => {
                debug!(error = %e, "completion service unreachable");
                OFFLINE_PROSE.to_string()
            }
        }
    }

    /// Prose-only chat with bounded history (last 10 turns).
    pub async fn chat(&self, message: &str, history: &[ChatTurn]) -> Result<ChatReply> {
        let query_vec = self.embedder.embed(message).await.unwrap_or_default();
        let hits = self
            .index
            .search(&query_vec, SOURCE_LIMIT, &Metadata::new())
            .await
            .unwrap_or_default();

        let mut sources = Vec::new();
        for hit in &hits {
            if let Some(receipt) = self.store.get(hit.id).await? {
                sources.push(receipt);
            }
        }

        let summary = self.store.summary().await?;
        let context = format!(
            "Ledger summary: {} receipts, {} {} total, {} {} VAT.\n{}",
            summary.count,
            cents_to_string(summary.total_cents),
            self.currency,
            cents_to_string(summary.vat_cents),
            self.currency,
            context_block(Intent::Freeform, None, sources.len() as i64, &sources, &self.currency),
        );

        let mut messages = vec![ChatMessage::system(format!(
            "{}\n\n{}",
            SYSTEM_PROMPT, context
        ))];
        let start = history.len().saturating_sub(10);
        for turn in &history[start..] {
            match turn.role.as_str() {
                "assistant" => messages.push(ChatMessage::assistant(turn.content.clone())),
                _ => messages.push(ChatMessage::user(turn.content.clone())),
            }
        }
        messages.push(ChatMessage::user(message.to_string()));

        let sources_used = sources.len();
        match self.completion.text(&messages).await {
            Ok(prose) => Ok(ChatReply {
                response: prose.trim().to_string(),
                sources_used,
            }),
            Err(_) => Ok(ChatReply {
                response: OFFLINE_PROSE.to_string(),
                sources_used,
            }),
        }
    }
}

// ============ Classification ============

/// Classify a question and extract its structured filters. Pure function;
/// `today` anchors relative date ranges.
pub fn classify(question: &str, vendor_norms: &[&str], today: NaiveDate) -> (Intent, QueryFilters) {
    let q = question.to_lowercase();

    let mut filters = QueryFilters {
        category: find_category(&q),
        vendor: find_vendor(&q, vendor_norms),
        top_k: find_top_k(&q),
        ..Default::default()
    };
    let (day_from, day_to) = find_period(&q, today);
    filters.day_from = day_from;
    filters.day_to = day_to;
    let (min_cents, max_cents) = find_amount_range(&q);
    filters.min_cents = min_cents;
    filters.max_cents = max_cents;

    let has_sum = contains_any(&q, SUM_KEYWORDS);
    let has_count = contains_any(&q, COUNT_KEYWORDS);
    let has_top = contains_any(&q, TOP_KEYWORDS);
    let has_find = contains_any(&q, FIND_KEYWORDS);
    let has_filter = filters.category.is_some()
        || filters.vendor.is_some()
        || filters.day_from.is_some()
        || filters.min_cents.is_some()
        || filters.max_cents.is_some();

    // First matching entry wins, in the fixed order.
    let intent = if has_sum && filters.category.is_some() {
        Intent::SumByCategory
    } else if has_sum && filters.vendor.is_some() {
        Intent::SumByVendor
    } else if has_sum && filters.day_from.is_some() {
        Intent::SumByPeriod
    } else if has_count {
        Intent::Count
    } else if has_top {
        Intent::ListTopK
    } else if has_find || has_filter || has_sum {
        Intent::FindSpecific
    } else {
        Intent::Freeform
    };

    (intent, filters)
}

fn contains_any(q: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| q.contains(k))
}

fn tokens(q: &str) -> Vec<String> {
    q.split(|c: char| !c.is_alphanumeric() && c != ',' && c != '.')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn find_category(q: &str) -> Option<String> {
    let toks = tokens(q);
    for (keyword, canonical) in CATEGORY_LEXICON {
        if toks.iter().any(|t| t == keyword) {
            return Some(canonical.to_string());
        }
    }
    None
}

fn find_vendor(q: &str, vendor_norms: &[&str]) -> Option<String> {
    // Longest name first so "rewe city" wins over "rewe".
    let mut sorted: Vec<&str> = vendor_norms.to_vec();
    sorted.sort_by_key(|v| std::cmp::Reverse(v.len()));
    sorted
        .iter()
        .find(|v| !v.is_empty() && q.contains(*v))
        .map(|v| v.to_string())
}

fn find_period(q: &str, today: NaiveDate) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let window = if q.contains("last week") || q.contains("this week") || q.contains("letzte woche")
    {
        Some(7)
    } else if q.contains("last month") || q.contains("this month") || q.contains("letzter monat")
        || q.contains("letzten monat")
    {
        Some(30)
    } else if q.contains("last quarter") || q.contains("this quarter")
        || q.contains("letztes quartal")
    {
        Some(90)
    } else if q.contains("last year") || q.contains("this year") || q.contains("letztes jahr") {
        Some(365)
    } else {
        None
    };

    match window {
        Some(days) => (Some(today - Duration::days(days)), Some(today)),
        None => (None, None),
    }
}

fn find_amount_range(q: &str) -> (Option<i64>, Option<i64>) {
    let normalized = q
        .replace("more than", "over")
        .replace("greater than", "over")
        .replace("above", "over")
        .replace("less than", "under")
        .replace("below", "under")
        .replace("über", "over")
        .replace("ueber", "over")
        .replace("unter", "under")
        .replace("zwischen", "between")
        .replace(" und ", " and ");

    let toks = tokens(&normalized);
    let amount_after = |keyword: &str| -> Option<i64> {
        let pos = toks.iter().position(|t| t == keyword)?;
        toks.get(pos + 1)
            .and_then(|t| parse_decimal_lenient(t))
            .map(to_cents)
    };

    if let Some(pos) = toks.iter().position(|t| t == "between") {
        let lo = toks.get(pos + 1).and_then(|t| parse_decimal_lenient(t));
        let hi = toks
            .iter()
            .skip(pos + 2)
            .skip_while(|t| *t != "and")
            .nth(1)
            .and_then(|t| parse_decimal_lenient(t));
        if let (Some(lo), Some(hi)) = (lo, hi) {
            return (Some(to_cents(lo)), Some(to_cents(hi)));
        }
    }

    (amount_after("over"), amount_after("under"))
}

fn find_top_k(q: &str) -> Option<usize> {
    let toks = tokens(q);
    let pos = toks.iter().position(|t| t == "top")?;
    Some(
        toks.get(pos + 1)
            .and_then(|t| t.parse::<usize>().ok())
            .filter(|k| *k > 0)
            .unwrap_or(DEFAULT_TOP_K),
    )
}

fn is_watch_category(category: &str) -> bool {
    SUSPICIOUS_CATEGORIES.contains(&category.to_lowercase().as_str())
}

// ============ Aggregation ============

fn domain_filter(intent: Intent, filters: &QueryFilters) -> ListFilter {
    let mut list = ListFilter::default();

    match intent {
        Intent::SumByCategory => match &filters.category {
            Some(category) if is_watch_category(category) => list.suspicious_only = true,
            Some(category) => list.category = Some(category.clone()),
            None => {}
        },
        Intent::SumByVendor => list.vendor_norm = filters.vendor.clone(),
        Intent::SumByPeriod => {
            list.day_from = filters.day_from;
            list.day_to = filters.day_to;
        }
        Intent::Count | Intent::ListTopK | Intent::FindSpecific => {
            list.vendor_norm = filters.vendor.clone();
            match &filters.category {
                Some(category) if is_watch_category(category) => list.suspicious_only = true,
                Some(category) => list.category = Some(category.clone()),
                None => {}
            }
            list.day_from = filters.day_from;
            list.day_to = filters.day_to;
            list.min_cents = filters.min_cents;
            list.max_cents = filters.max_cents;
        }
        Intent::Freeform => {}
    }

    list
}

/// Compute the deterministic numeric result over the domain. Returns
/// `(total_cents, count, domain)`; for `list_top_k` the domain shrinks to
/// the listed receipts.
fn aggregate(
    intent: Intent,
    filters: &QueryFilters,
    mut domain: Vec<Receipt>,
) -> (i64, i64, Vec<Receipt>) {
    if intent == Intent::ListTopK {
        domain.sort_by(|a, b| b.total_cents.cmp(&a.total_cents).then(a.id.cmp(&b.id)));
        domain.truncate(filters.top_k.unwrap_or(DEFAULT_TOP_K));
    }

    let watch = matches!(intent, Intent::SumByCategory)
        && filters
            .category
            .as_deref()
            .is_some_and(is_watch_category);

    let total: i64 = if watch {
        domain.iter().map(watchlist_contribution).sum()
    } else {
        domain.iter().map(|r| r.total_cents).sum()
    };

    let count = domain.len() as i64;
    (total, count, domain)
}

/// Amount a suspicious receipt contributes to a watchlist-category sum: its
/// watchlist-matching line items, or the net total when the flag came from
/// the category alone.
fn watchlist_contribution(receipt: &Receipt) -> i64 {
    let matching: i64 = receipt
        .items
        .iter()
        .filter(|i| matches_watchlist(&i.description))
        .map(|i| i.total_cents)
        .sum();
    if matching > 0 {
        matching
    } else {
        receipt.total_cents - receipt.tax_cents
    }
}

// ============ Prompt context ============

fn context_block(
    intent: Intent,
    total_cents: Option<i64>,
    count: i64,
    sources: &[Receipt],
    currency: &str,
) -> String {
    let mut lines = vec!["CONTEXT".to_string(), format!("Intent: {}", intent.as_str())];

    match total_cents {
        Some(cents) => lines.push(format!(
            "Deterministic result: total {} {}, {} matching receipts",
            cents_to_string(cents),
            currency,
            count
        )),
        None => lines.push(format!("Matching receipts: {}", count)),
    }

    if sources.is_empty() {
        lines.push("Source receipts: none".to_string());
    } else {
        lines.push("Source receipts:".to_string());
        for receipt in sources {
            let mut flags = Vec::new();
            if receipt.flags.duplicate {
                flags.push("duplicate");
            }
            if receipt.flags.suspicious {
                flags.push("suspicious");
            }
            if receipt.flags.missing_vat {
                flags.push("missing-vat");
            }
            if receipt.flags.math_error {
                flags.push("math-error");
            }
            let flag_note = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            lines.push(format!(
                "- #{} {} {} {} {}{}{}",
                receipt.id,
                receipt.vendor,
                receipt.day,
                cents_to_string(receipt.total_cents),
                receipt.currency,
                receipt
                    .category
                    .as_deref()
                    .map(|c| format!(" ({})", c))
                    .unwrap_or_default(),
                flag_note,
            ));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditFlags;
    use chrono::TimeZone;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn alcohol_question_is_sum_by_category() {
        let (intent, filters) = classify("how much did I spend on alcohol?", &[], today());
        assert_eq!(intent, Intent::SumByCategory);
        assert_eq!(filters.category.as_deref(), Some("alcohol"));
    }

    #[test]
    fn category_beats_vendor_on_ties() {
        // Both a category keyword and a vendor name appear; first entry in
        // the fixed order wins.
        let (intent, filters) = classify(
            "total spent on electronics at saturn",
            &["saturn"],
            today(),
        );
        assert_eq!(intent, Intent::SumByCategory);
        assert_eq!(filters.category.as_deref(), Some("Electronics"));
        assert_eq!(filters.vendor.as_deref(), Some("saturn"));
    }

    #[test]
    fn vendor_sum_classified() {
        let (intent, filters) = classify("how much did we spend at rewe?", &["rewe"], today());
        assert_eq!(intent, Intent::SumByVendor);
        assert_eq!(filters.vendor.as_deref(), Some("rewe"));
    }

    #[test]
    fn period_sum_classified() {
        let (intent, filters) = classify("total expenses last month", &[], today());
        assert_eq!(intent, Intent::SumByPeriod);
        assert_eq!(filters.day_from, Some(today() - Duration::days(30)));
        assert_eq!(filters.day_to, Some(today()));
    }

    #[test]
    fn quarter_window_is_ninety_days() {
        let (_, filters) = classify("how much did we spend last quarter", &[], today());
        assert_eq!(filters.day_from, Some(today() - Duration::days(90)));
    }

    #[test]
    fn count_classified() {
        let (intent, _) = classify("how many receipts from shell?", &["shell"], today());
        assert_eq!(intent, Intent::Count);
    }

    #[test]
    fn top_k_classified_with_explicit_k() {
        let (intent, filters) = classify("what were my top 5 expenses?", &[], today());
        assert_eq!(intent, Intent::ListTopK);
        assert_eq!(filters.top_k, Some(5));

        let (_, filters) = classify("largest expenses this year", &[], today());
        assert_eq!(filters.top_k, None);
    }

    #[test]
    fn find_specific_classified() {
        let (intent, _) = classify("show me all fuel receipts", &[], today());
        assert_eq!(intent, Intent::FindSpecific);
    }

    #[test]
    fn freeform_fallback() {
        let (intent, filters) = classify("tell me about my business", &[], today());
        assert_eq!(intent, Intent::Freeform);
        assert_eq!(filters, QueryFilters::default());
    }

    #[test]
    fn german_questions_classify() {
        let (intent, filters) = classify("wie viel habe ich für alkohol ausgegeben?", &[], today());
        assert_eq!(intent, Intent::SumByCategory);
        assert_eq!(filters.category.as_deref(), Some("alcohol"));

        let (intent, _) = classify("wie viele belege habe ich?", &[], today());
        assert_eq!(intent, Intent::Count);
    }

    #[test]
    fn amount_ranges_extracted() {
        let (_, filters) = classify("show receipts over 100", &[], today());
        assert_eq!(filters.min_cents, Some(10000));

        let (_, filters) = classify("receipts under 50,50", &[], today());
        assert_eq!(filters.max_cents, Some(5050));

        let (_, filters) = classify("receipts between 20 and 80", &[], today());
        assert_eq!(filters.min_cents, Some(2000));
        assert_eq!(filters.max_cents, Some(8000));
    }

    fn receipt(id: i64, total_cents: i64, tax_cents: i64, items: &[(&str, i64)]) -> Receipt {
        Receipt {
            id,
            vendor: "Bar".to_string(),
            vendor_norm: "bar".to_string(),
            date: Utc
                .with_ymd_and_hms(2024, 2, 1, 22, 0, 0)
                .unwrap()
                .fixed_offset(),
            day: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            total_cents,
            tax_cents,
            currency: "EUR".to_string(),
            category: None,
            payment_method: None,
            receipt_number: None,
            image_ref: None,
            flags: AuditFlags {
                suspicious: true,
                ..Default::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            items: items
                .iter()
                .enumerate()
                .map(|(i, (desc, cents))| crate::models::LineItem {
                    id: i as i64 + 1,
                    description: desc.to_string(),
                    quantity: 1,
                    unit_price_cents: *cents,
                    total_cents: *cents,
                    vat_percent: None,
                })
                .collect(),
        }
    }

    #[test]
    fn watchlist_sum_takes_matching_lines() {
        let r = receipt(3, 3000, 475, &[("Beer", 500), ("Wine", 2000)]);
        assert_eq!(watchlist_contribution(&r), 2500);
    }

    #[test]
    fn watchlist_sum_falls_back_to_net_total() {
        let r = receipt(4, 3000, 475, &[("Peanuts", 3000)]);
        assert_eq!(watchlist_contribution(&r), 2525);
    }

    #[test]
    fn aggregate_top_k_sorts_by_total() {
        let domain = vec![
            receipt(1, 100, 0, &[]),
            receipt(2, 900, 0, &[]),
            receipt(3, 500, 0, &[]),
        ];
        let filters = QueryFilters {
            top_k: Some(2),
            ..Default::default()
        };
        let (total, count, listed) = aggregate(Intent::ListTopK, &filters, domain);
        assert_eq!(total, 1400);
        assert_eq!(count, 2);
        assert_eq!(listed[0].id, 2);
        assert_eq!(listed[1].id, 3);
    }

    #[test]
    fn context_block_contains_the_numbers() {
        let r = receipt(3, 3000, 475, &[("Beer", 500)]);
        let block = context_block(Intent::SumByCategory, Some(2500), 1, &[r], "EUR");
        assert!(block.contains("total 25.00 EUR"));
        assert!(block.contains("#3 Bar"));
        assert!(block.contains("[suspicious]"));
    }
}
