//! Shared fixtures: a temp database and a scripted AI provider.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use kb_curator::config::Config;
use kb_curator::provider::{AiProvider, ChatRequest, TokenStream};
use kb_curator::{db, domains, migrate};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const EMBED_DIMS: usize = 64;

/// Which prompt a request carries, told apart by its system message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Classify,
    Extract,
    Add,
    Correct,
    Intent,
    Answer,
}

impl Route {
    fn of(request: &ChatRequest) -> Route {
        let s = request.system.as_str();
        if s.contains("classify documents") {
            Route::Classify
        } else if s.contains("extract business knowledge") {
            Route::Extract
        } else if s.contains("manager's note") {
            Route::Add
        } else if s.contains("manager's correction") {
            Route::Correct
        } else if s.contains("route questions") {
            Route::Intent
        } else {
            Route::Answer
        }
    }
}

#[derive(Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

/// Test double for [`AiProvider`].
///
/// Replies are queued per route. The last queued reply is sticky, so a
/// single `reply` answers every later call on that route. Embeddings are a
/// deterministic bag of words, so texts sharing words are similar.
#[derive(Default)]
pub struct FakeProvider {
    scripts: Mutex<HashMap<Route, VecDeque<Reply>>>,
    requests: Mutex<Vec<(Route, ChatRequest)>>,
    embed_failure: Mutex<Option<String>>,
    embedded: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, route: Route, text: impl Into<String>) {
        self.push(route, Reply::Text(text.into()));
    }

    pub fn reply_json(&self, route: Route, value: Value) {
        self.reply(route, value.to_string());
    }

    pub fn fail(&self, route: Route, message: impl Into<String>) {
        self.push(route, Reply::Fail(message.into()));
    }

    pub fn fail_embeddings(&self, message: impl Into<String>) {
        *self.embed_failure.lock().unwrap() = Some(message.into());
    }

    pub fn restore_embeddings(&self) {
        *self.embed_failure.lock().unwrap() = None;
    }

    pub fn requests(&self, route: Route) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == route)
            .map(|(_, req)| req.clone())
            .collect()
    }

    pub fn embedded_texts(&self) -> Vec<String> {
        self.embedded.lock().unwrap().clone()
    }

    fn push(&self, route: Route, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(route)
            .or_default()
            .push_back(reply);
    }

    fn next(&self, request: &ChatRequest) -> Result<String> {
        let route = Route::of(request);
        self.requests.lock().unwrap().push((route, request.clone()));
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(&route)
            .ok_or_else(|| anyhow!("no scripted reply for {:?}", route))?;
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply for {:?}", route)),
        }
    }
}

#[async_trait]
impl AiProvider for FakeProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        self.next(request)
    }

    async fn complete_streaming(&self, request: &ChatRequest) -> Result<TokenStream> {
        let text = self.next(request)?;
        let chars: Vec<char> = text.chars().collect();
        let tokens: Vec<Result<String>> = chars
            .chunks(16)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(stream::iter(tokens).boxed())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(message) = self.embed_failure.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        self.embedded.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Hash each lowercased word into one of [`EMBED_DIMS`] buckets.
pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBED_DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
    {
        let mut hash: u32 = 0x811c9dc5;
        for b in word.to_lowercase().bytes() {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x01000193);
        }
        v[hash as usize % EMBED_DIMS] += 1.0;
    }
    v
}

/// A migrated database in a temp dir. Keep the `TempDir` alive.
pub async fn setup() -> (TempDir, SqlitePool, Arc<Config>) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("kb.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, pool, Arc::new(config))
}

/// `pricing`, `deadlines`, and `urgent` under `pricing`.
pub async fn seed_domains(pool: &SqlitePool) {
    domains::create_domain(pool, "pricing", "Цены", Some("Тарифы и наценки"), None)
        .await
        .unwrap();
    domains::create_domain(pool, "deadlines", "Сроки", None, None)
        .await
        .unwrap();
    domains::create_domain(pool, "urgent", "Срочные заказы", None, Some("pricing"))
        .await
        .unwrap();
}

pub const PRICE_TEXT: &str = "Прайс-лист бюро переводов.\n\n\
Письменный перевод с английского языка стоит 500 рублей за страницу.\n\n\
Срочный перевод в течение суток оплачивается с наценкой 50 процентов.\n\n\
Нотариальное заверение перевода стоит 800 рублей за документ.";

pub fn classification(primary: &str, secondary: &[&str]) -> Value {
    json!({
        "documentDomains": [{
            "primaryDomainSlug": primary,
            "secondaryDomainSlugs": secondary,
            "confidence": 0.9,
            "reason": "Документ о ценах"
        }],
        "newDomainSuggestions": [{
            "suggestedSlug": "notary",
            "title": "Нотариат",
            "description": "Заверение переводов",
            "parentSlug": null,
            "confidence": 0.6,
            "reason": "Нет подходящего домена"
        }],
        "questionsForHuman": ["Действует ли прайс для юрлиц?"]
    })
}

pub fn extraction() -> Value {
    json!({
        "rules": [
            {
                "ruleCode": "R-1",
                "title": "Стоимость письменного перевода",
                "body": "Письменный перевод с английского языка стоит 500 рублей за страницу.",
                "confidence": 0.95,
                "sourceSpan": {"quote": "стоит 500 рублей за страницу", "locationHint": "абзац 2"}
            },
            {
                "ruleCode": "R-2",
                "title": "Наценка за срочность",
                "body": "Срочный перевод в течение суток оплачивается с наценкой 50 процентов.",
                "confidence": 0.9,
                "sourceSpan": {"quote": "наценкой 50 процентов", "locationHint": "абзац 3"}
            }
        ],
        "qaPairs": [
            {
                "question": "Сколько стоит срочный перевод?",
                "answer": "Обычная цена плюс 50 процентов.",
                "linkedRuleCode": "R-2"
            }
        ],
        "uncertainties": [
            {
                "type": "ambiguity",
                "description": "Не указано, что считается страницей.",
                "suggestedQuestion": "Сколько знаков в расчётной странице?"
            }
        ]
    })
}

/// A provider scripted for one full, successful processing run.
pub fn happy_provider() -> Arc<FakeProvider> {
    let provider = FakeProvider::new();
    provider.reply_json(Route::Classify, classification("pricing", &["urgent", "pricing"]));
    provider.reply_json(Route::Extract, extraction());
    provider
}
