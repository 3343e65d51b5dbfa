use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use evalflow_types::Source;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
	pub role: String,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
	pub question: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub history: Vec<ChatTurn>,
}

impl ChatRequest {
	pub fn new(question: impl Into<String>) -> Self {
		Self {
			question: question.into(),
			history: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
	#[serde(alias = "modelResponse", alias = "response")]
	pub answer: String,
	#[serde(default)]
	pub sources: Vec<Source>,
}

impl ChatResponse {
	pub fn new(answer: impl Into<String>) -> Self {
		Self {
			answer: answer.into(),
			sources: Vec::new(),
		}
	}

	/// Newline-joined source excerpts (or titles when a source has no
	/// excerpt). `None` when nothing was retrieved.
	pub fn retrieved_context(&self) -> Option<String> {
		let parts: Vec<&str> = self
			.sources
			.iter()
			.map(|s| s.excerpt.as_deref().unwrap_or_else(|| s.display_title()))
			.filter(|p| !p.trim().is_empty())
			.collect();
		if parts.is_empty() {
			None
		} else {
			Some(parts.join("\n"))
		}
	}
}

/// The conversational system under evaluation.
#[async_trait]
pub trait ChatClient: Send + Sync {
	async fn ask(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// Wrap an async closure as a `ChatClient`.
pub fn from_async_fn<F, Fut>(f: F) -> Arc<dyn ChatClient>
where
	F: Send + Sync + 'static + Fn(&ChatRequest) -> Fut,
	Fut: Future<Output = Result<ChatResponse>> + Send + 'static,
{
	struct ClosureChat<F> {
		f: F,
	}

	#[async_trait]
	impl<F, Fut> ChatClient for ClosureChat<F>
	where
		F: Send + Sync + 'static + Fn(&ChatRequest) -> Fut,
		Fut: Future<Output = Result<ChatResponse>> + Send + 'static,
	{
		async fn ask(&self, request: &ChatRequest) -> Result<ChatResponse> {
			(self.f)(request).await
		}
	}

	Arc::new(ClosureChat { f })
}

/// POSTs `{"userMessage", "chatHistory"}` and expects a JSON body with the
/// answer under `answer`, `modelResponse` or `response`.
pub struct HttpChatClient {
	client: reqwest::Client,
	url: String,
}

impl HttpChatClient {
	pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("failed to build HTTP client")?;
		Ok(Self {
			client,
			url: url.into(),
		})
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpChatBody<'a> {
	user_message: &'a str,
	chat_history: &'a [ChatTurn],
}

#[async_trait]
impl ChatClient for HttpChatClient {
	async fn ask(&self, request: &ChatRequest) -> Result<ChatResponse> {
		let body = HttpChatBody {
			user_message: &request.question,
			chat_history: &request.history,
		};
		let resp = self.client.post(&self.url).json(&body).send().await?;
		let status = resp.status();
		if !status.is_success() {
			let text = resp.text().await.unwrap_or_default();
			anyhow::bail!("HTTP {}: {}", status.as_u16(), text);
		}
		resp.json::<ChatResponse>()
			.await
			.context("chat response did not match the expected shape")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn test_closure_chat() {
		let chat = from_async_fn(|req| {
			let q = req.question.clone();
			async move { Ok(ChatResponse::new(format!("echo: {q}"))) }
		});
		let resp = chat.ask(&ChatRequest::new("hi")).await.unwrap();
		assert_eq!(resp.answer, "echo: hi");
		assert_eq!(resp.retrieved_context(), None);
	}

	#[test]
	fn test_response_aliases_and_context() {
		let resp: ChatResponse = serde_json::from_value(json!({
			"modelResponse": "Paris",
			"sources": [
				{"title": "Atlas", "uri": "s3://kb/atlas.pdf", "excerpt": "Paris is the capital."},
				{"title": "", "uri": "s3://kb/france.txt"}
			]
		}))
		.unwrap();
		assert_eq!(resp.answer, "Paris");
		assert_eq!(
			resp.retrieved_context().as_deref(),
			Some("Paris is the capital.\nfrance.txt")
		);
	}
}
