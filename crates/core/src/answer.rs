use crate::traits::{ChatDelta, ChatModel, ChatStream};
use crate::{RerankedResult, SearchError};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;

pub const ANSWER_SYSTEM_PROMPT: &str =
    "你是应急管理领域的专业顾问，请根据用户提供的上下文回答问题，回答要专业、条理清晰。";

/// Stand-in for the evidence section when retrieval found nothing.
pub const NO_EVIDENCE: &str = "没有查到";

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReasoningMode {
    /// Plain answers only.
    #[default]
    Strip,
    /// Reasoning increments are forwarded, tagged as such.
    Surface,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerDelta {
    Text(String),
    Reasoning(String),
}

pub type AnswerStream = BoxStream<'static, Result<AnswerDelta, SearchError>>;

pub fn answer_prompt(query: &str, evidence: &[RerankedResult]) -> String {
    let background = if evidence.is_empty() {
        NO_EVIDENCE.to_string()
    } else {
        evidence
            .iter()
            .map(|result| result.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!("问题: {query}\n\n背景知识:\n{background}")
}

/// Separates inline `<think>` spans from answer text across increments.
/// Only a possible partial tag at the end of an increment is held back.
#[derive(Debug, Default)]
pub struct ThinkSplitter {
    pending: String,
    inside: bool,
}

impl ThinkSplitter {
    pub fn push(&mut self, piece: &str) -> Vec<AnswerDelta> {
        self.pending.push_str(piece);
        let mut out = Vec::new();

        loop {
            let marker = if self.inside { THINK_CLOSE } else { THINK_OPEN };
            if let Some(position) = self.pending.find(marker) {
                let before: String = self.pending.drain(..position).collect();
                self.emit(before, &mut out);
                self.pending.drain(..marker.len());
                self.inside = !self.inside;
                continue;
            }

            let held = partial_marker_len(&self.pending, marker);
            let cut = self.pending.len() - held;
            let ready: String = self.pending.drain(..cut).collect();
            self.emit(ready, &mut out);
            return out;
        }
    }

    /// Releases whatever was held back once the stream has ended.
    pub fn finish(&mut self) -> Vec<AnswerDelta> {
        let rest = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        self.emit(rest, &mut out);
        out
    }

    fn emit(&self, text: String, out: &mut Vec<AnswerDelta>) {
        if text.is_empty() {
            return;
        }
        out.push(if self.inside {
            AnswerDelta::Reasoning(text)
        } else {
            AnswerDelta::Text(text)
        });
    }
}

fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|len| {
            text.len() >= *len
                && text.is_char_boundary(text.len() - len)
                && marker.starts_with(&text[text.len() - len..])
        })
        .unwrap_or(0)
}

struct ForwardState {
    inner: ChatStream,
    splitter: ThinkSplitter,
    mode: ReasoningMode,
    pending: VecDeque<AnswerDelta>,
    finished: bool,
}

impl ForwardState {
    fn queue(&mut self, deltas: Vec<AnswerDelta>) {
        for delta in deltas {
            match (&delta, self.mode) {
                (AnswerDelta::Reasoning(_), ReasoningMode::Strip) => {}
                _ => self.pending.push_back(delta),
            }
        }
    }
}

/// Maps raw chat increments onto answer increments, one in, zero or more out.
pub fn forward_answer(inner: ChatStream, mode: ReasoningMode) -> AnswerStream {
    let state = ForwardState {
        inner,
        splitter: ThinkSplitter::default(),
        mode,
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(ChatDelta::Content(piece))) => {
                    let deltas = state.splitter.push(&piece);
                    state.queue(deltas);
                }
                Some(Ok(ChatDelta::Reasoning(piece))) => {
                    state.queue(vec![AnswerDelta::Reasoning(piece)]);
                }
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.finished = true;
                    let deltas = state.splitter.finish();
                    state.queue(deltas);
                }
            }
        }
    })
    .boxed()
}

/// Concatenates the text channel of an answer stream.
pub async fn collect_answer(mut stream: AnswerStream) -> Result<String, SearchError> {
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        if let AnswerDelta::Text(piece) = delta? {
            text.push_str(&piece);
        }
    }
    Ok(text)
}

pub struct AnswerComposer<C: ChatModel> {
    chat: C,
}

impl<C: ChatModel> AnswerComposer<C> {
    pub fn new(chat: C) -> Self {
        Self { chat }
    }

    pub async fn compose(
        &self,
        query: &str,
        evidence: &[RerankedResult],
        mode: ReasoningMode,
    ) -> Result<AnswerStream, SearchError> {
        let prompt = answer_prompt(query, evidence);
        tracing::debug!(query, evidence = evidence.len(), "streaming answer");
        let inner = self.chat.stream(ANSWER_SYSTEM_PROMPT, &prompt).await?;
        Ok(forward_answer(inner, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingChat {
        deltas: Vec<Result<ChatDelta, String>>,
        prompts: Mutex<Vec<(String, String)>>,
    }

    impl RecordingChat {
        fn new(deltas: Vec<Result<ChatDelta, String>>) -> Self {
            Self {
                deltas,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for RecordingChat {
        async fn stream(&self, system: &str, user: &str) -> Result<ChatStream, SearchError> {
            self.prompts
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            let items: Vec<Result<ChatDelta, SearchError>> = self
                .deltas
                .iter()
                .cloned()
                .map(|item| item.map_err(|message| SearchError::unavailable("chat model", message)))
                .collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    fn content(text: &str) -> Result<ChatDelta, String> {
        Ok(ChatDelta::Content(text.to_string()))
    }

    fn text_of(deltas: &[AnswerDelta]) -> String {
        deltas
            .iter()
            .filter_map(|delta| match delta {
                AnswerDelta::Text(text) => Some(text.as_str()),
                AnswerDelta::Reasoning(_) => None,
            })
            .collect()
    }

    #[test]
    fn prompt_joins_evidence_with_blank_lines() {
        let evidence = vec![
            RerankedResult {
                content: "第一条".to_string(),
                score: 0.9,
            },
            RerankedResult {
                content: "第二条".to_string(),
                score: 0.1,
            },
        ];
        assert_eq!(
            answer_prompt("怎么办", &evidence),
            "问题: 怎么办\n\n背景知识:\n第一条\n\n第二条"
        );
        assert_eq!(answer_prompt("怎么办", &[]), "问题: 怎么办\n\n背景知识:\n没有查到");
    }

    #[test]
    fn think_tags_split_across_increments_are_removed() {
        let mut splitter = ThinkSplitter::default();
        let mut deltas = Vec::new();
        for piece in ["答案前", "<thi", "nk>内部推理</th", "ink>", "答案后<", "b>"] {
            deltas.extend(splitter.push(piece));
        }
        deltas.extend(splitter.finish());

        assert_eq!(text_of(&deltas), "答案前答案后<b>");
        assert!(deltas.contains(&AnswerDelta::Reasoning("内部推理".to_string())));
    }

    #[test]
    fn only_a_possible_tag_prefix_is_held_back() {
        let mut splitter = ThinkSplitter::default();
        assert_eq!(splitter.push("abc<t"), vec![AnswerDelta::Text("abc".to_string())]);
        assert_eq!(splitter.push("able"), vec![AnswerDelta::Text("<table".to_string())]);
        assert!(splitter.finish().is_empty());
    }

    #[tokio::test]
    async fn strip_mode_forwards_plain_answer_only() {
        let chat = RecordingChat::new(vec![
            Ok(ChatDelta::Reasoning("hidden".to_string())),
            content("<think>x</think>"),
            content("撤离"),
            content("到高处"),
        ]);
        let composer = AnswerComposer::new(chat);

        let stream = composer.compose("洪水", &[], ReasoningMode::Strip).await.unwrap();
        let deltas: Vec<AnswerDelta> = stream.map(|delta| delta.unwrap()).collect().await;

        assert_eq!(
            deltas,
            vec![
                AnswerDelta::Text("撤离".to_string()),
                AnswerDelta::Text("到高处".to_string()),
            ]
        );
        let prompts = composer.chat.prompts.lock().unwrap();
        assert_eq!(prompts[0].0, ANSWER_SYSTEM_PROMPT);
        assert!(prompts[0].1.ends_with(NO_EVIDENCE));
    }

    #[tokio::test]
    async fn surface_mode_tags_reasoning() {
        let chat = RecordingChat::new(vec![
            Ok(ChatDelta::Reasoning("先想一想".to_string())),
            content("答案"),
        ]);
        let stream = AnswerComposer::new(chat)
            .compose("q", &[], ReasoningMode::Surface)
            .await
            .unwrap();
        let deltas: Vec<AnswerDelta> = stream.map(|delta| delta.unwrap()).collect().await;

        assert_eq!(
            deltas,
            vec![
                AnswerDelta::Reasoning("先想一想".to_string()),
                AnswerDelta::Text("答案".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn collaborator_errors_end_the_stream() {
        let chat = RecordingChat::new(vec![
            content("部分"),
            Err("reset".to_string()),
            content("never"),
        ]);
        let mut stream = AnswerComposer::new(chat)
            .compose("q", &[], ReasoningMode::Strip)
            .await
            .unwrap();

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            AnswerDelta::Text("部分".to_string())
        );
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn collect_answer_concatenates_text() {
        let chat = RecordingChat::new(vec![content("a"), content("b")]);
        let stream = AnswerComposer::new(chat)
            .compose("q", &[], ReasoningMode::Strip)
            .await
            .unwrap();
        assert_eq!(collect_answer(stream).await.unwrap(), "ab");
    }
}
