use crate::traits::ChatModel;
use crate::{ExpandedQuerySet, SearchError};
use regex::Regex;
use std::collections::BTreeMap;

pub const EXPANSION_SYSTEM_PROMPT: &str = "你是一名应急管理领域的专业顾问。";

const PARAPHRASE_SLOTS: u32 = 3;
const MAX_SLOT: u32 = 5;

pub fn expansion_prompt(query: &str) -> String {
    format!(
        "你是一名应急管理领域的专业顾问。你的任务是生成三个与用户问题相差不多的问题，\
         例如用户问题为“碰到洪灾天气怎么办”，你可以生成问题“洪灾天气如何应对”，“洪灾天气如何自救”，\
         “洪灾天气如何预防”三个问题，以及问题中最重要的2个关键字分块。\n\
         通过对用户问题产生多种视角，帮助用户克服基于距离的相似性搜索的一些局限性。\n\
         用换行符分隔返回你生成的问题和分块：问题编号为1、2、3，分块编号为4和5，每个分块是一个关键字。\n\
         只返回3个问题和2个分块，其他不需要。\n\n\
         用户问题：{query}"
    )
}

/// Vector hits kept for a hypothetical draft.
pub const DEFAULT_HYPOTHETICAL_K: usize = 3;

pub const HYPOTHETICAL_SYSTEM_PROMPT: &str = "你是一名应急管理领域的资料撰写助手。";

/// Asks for an answer, or failing that a document that would contain one.
/// The draft is only used as a vector query.
pub fn hypothetical_prompt(query: &str) -> String {
    format!(
        "你是一名应急管理领域的专业顾问，请根据问题回答：\n\
         用户问题：{query}\n\
         如果你无法回答，请根据问题生成一个可以回答这个问题的假设性文档。"
    )
}

/// Pulls numbered lines out of a raw completion.
pub struct ExpansionParser {
    think_block: Regex,
    numbered_line: Regex,
}

impl ExpansionParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            think_block: Regex::new(r"(?s)<think>.*?</think>")?,
            numbered_line: Regex::new(r"^(\d+)\.\s*(.+)$")?,
        })
    }

    /// The completion with `<think>` blocks removed and whitespace trimmed.
    pub fn strip_reasoning(&self, raw: &str) -> String {
        self.think_block.replace_all(raw, "").trim().to_string()
    }

    /// Numbered entries keyed by their numeral, first occurrence wins,
    /// numerals outside 1..=5 dropped, ascending.
    pub fn numbered_entries(&self, raw: &str) -> Vec<(u32, String)> {
        let visible = self.think_block.replace_all(raw, "");
        let mut entries: BTreeMap<u32, String> = BTreeMap::new();

        for line in visible.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let Some(captures) = self.numbered_line.captures(line) else {
                continue;
            };
            let Ok(number) = captures[1].parse::<u32>() else {
                continue;
            };
            let text = captures[2].trim();
            if !(1..=MAX_SLOT).contains(&number) || text.is_empty() {
                continue;
            }
            entries.entry(number).or_insert_with(|| text.to_string());
        }

        entries.into_iter().collect()
    }

    pub fn parse(&self, original: &str, raw: &str) -> ExpandedQuerySet {
        let mut set = ExpandedQuerySet::original_only(original);
        for (number, text) in self.numbered_entries(raw) {
            if number <= PARAPHRASE_SLOTS {
                set.paraphrases.push(text);
            } else {
                set.keywords.push(text);
            }
        }
        set
    }
}

pub struct QueryExpander<C: ChatModel> {
    chat: C,
    parser: ExpansionParser,
}

impl<C: ChatModel> QueryExpander<C> {
    pub fn new(chat: C) -> Result<Self, regex::Error> {
        Ok(Self {
            chat,
            parser: ExpansionParser::new()?,
        })
    }

    pub async fn expand(&self, query: &str) -> Result<ExpandedQuerySet, SearchError> {
        let raw = self
            .chat
            .complete(EXPANSION_SYSTEM_PROMPT, &expansion_prompt(query))
            .await?;
        let set = self.parser.parse(query, &raw);

        if set.paraphrases.is_empty() && set.keywords.is_empty() {
            tracing::warn!(query, "expansion produced no numbered lines");
        } else {
            tracing::debug!(
                query,
                paraphrases = set.paraphrases.len(),
                keywords = set.keywords.len(),
                "query expanded"
            );
        }
        Ok(set)
    }

    /// Drafts a document that would answer `query`. An empty string means
    /// the model produced nothing usable.
    pub async fn draft_document(&self, query: &str) -> Result<String, SearchError> {
        let raw = self
            .chat
            .complete(HYPOTHETICAL_SYSTEM_PROMPT, &hypothetical_prompt(query))
            .await?;
        let draft = self.parser.strip_reasoning(&raw);
        tracing::debug!(query, chars = draft.chars().count(), "hypothetical document drafted");
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChatDelta, ChatStream};
    use async_trait::async_trait;
    use futures::StreamExt;

    struct ScriptedChat {
        deltas: Vec<ChatDelta>,
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn stream(&self, _system: &str, _user: &str) -> Result<ChatStream, SearchError> {
            let items: Vec<Result<ChatDelta, SearchError>> =
                self.deltas.iter().cloned().map(Ok).collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    #[test]
    fn think_blocks_are_removed_and_lines_sorted() {
        let parser = ExpansionParser::new().unwrap();
        let raw = "<think>\n1. 这不是答案\n</think>\n\
                   4. 洪灾\n\
                   2. 洪灾天气如何自救\n\
                   1. 洪灾天气如何应对\n\
                   3.洪灾天气如何预防\n\
                   5. 天气";

        let set = parser.parse("碰到洪灾天气怎么办", raw);

        assert_eq!(
            set.paraphrases,
            vec!["洪灾天气如何应对", "洪灾天气如何自救", "洪灾天气如何预防"]
        );
        assert_eq!(set.keywords, vec!["洪灾", "天气"]);
    }

    #[test]
    fn duplicate_and_out_of_range_numerals_are_dropped() {
        let parser = ExpansionParser::new().unwrap();
        let raw = "1. first\n1. second\n6. sixth\n0. zero\n- 2. bullet\n12. twelve\n2. kept";

        assert_eq!(
            parser.numbered_entries(raw),
            vec![(1, "first".to_string()), (2, "kept".to_string())]
        );
    }

    #[test]
    fn malformed_output_degenerates_to_the_original_query() {
        let parser = ExpansionParser::new().unwrap();
        let set = parser.parse("地震怎么办", "好的，下面是我的建议：多准备物资。");

        assert_eq!(set, ExpandedQuerySet::original_only("地震怎么办"));
        assert_eq!(set.seeds(), vec!["地震怎么办"]);
    }

    #[tokio::test]
    async fn expander_reads_only_the_content_channel() {
        let chat = ScriptedChat {
            deltas: vec![
                ChatDelta::Reasoning("1. leaked reasoning".to_string()),
                ChatDelta::Content("1. 台风来临如何应对\n".to_string()),
                ChatDelta::Content("4. 台风".to_string()),
            ],
        };
        let expander = QueryExpander::new(chat).unwrap();

        let set = expander.expand("台风怎么办").await.unwrap();

        assert_eq!(set.paraphrases, vec!["台风来临如何应对"]);
        assert_eq!(set.keywords, vec!["台风"]);
    }

    #[tokio::test]
    async fn drafts_drop_inline_reasoning() {
        let chat = ScriptedChat {
            deltas: vec![
                ChatDelta::Content("<think>先想一想</think>\n".to_string()),
                ChatDelta::Content("  暴雨预警分为蓝、黄、橙、红四级。 ".to_string()),
            ],
        };
        let expander = QueryExpander::new(chat).unwrap();

        let draft = expander.draft_document("暴雨预警有几级").await.unwrap();

        assert_eq!(draft, "暴雨预警分为蓝、黄、橙、红四级。");
    }
}
