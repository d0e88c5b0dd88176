//! LinkedIn profile lookup and extraction via the Exa search API.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use rpe_core::{EnrichedRecord, MemberRecord, ProfileFacts};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rpe-enrich";

pub const DEFAULT_BASE_URL: &str = "https://api.exa.ai";

const SEARCH_RESULT_COUNT: usize = 5;
const PROFILE_TEXT_MAX_CHARS: usize = 10_000;
const ORG_SEARCH_RESULT_COUNT: usize = 3;
const ORG_SEARCH_MAX_CHARS: usize = 2_000;
const EXPERIENCE_HEADING: &str = "## Experience";
const EDUCATION_HEADING: &str = "## Education";

/// Why a single record could not be enriched. Each variant is a per-record
/// failure: the runner logs it and moves on.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("no confident match for query {query:?}")]
    NoMatch { query: String },
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search API returned status {status}")]
    Api { status: u16 },
    #[error("malformed search response: {0}")]
    Malformed(String),
}

/// One profile lookup per record: either a fully populated output row or a
/// typed failure. No retries, no rate limiting in here.
#[async_trait]
pub trait ProfileSearcher: Send + Sync {
    async fn enrich(&self, member: &MemberRecord) -> Result<EnrichedRecord, EnrichError>;
}

#[derive(Debug, Clone)]
pub struct ExaConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Appended to person queries to disambiguate common names, e.g. a
    /// campus or company name. May be empty.
    pub search_hint: String,
    /// Organization whose roles get extracted into `org_role_years`. May be
    /// empty, which disables role extraction and the web fallback.
    pub org_name: String,
}

impl Default for ExaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            search_hint: String::new(),
            org_name: String::new(),
        }
    }
}

#[derive(Debug)]
pub struct ExaClient {
    config: ExaConfig,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    query: &'a str,
    num_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_domains: Option<Vec<&'a str>>,
    contents: ContentsSpec,
}

#[derive(Debug, Clone, Serialize)]
struct ContentsRequest<'a> {
    urls: Vec<&'a str>,
    text: TextSpec,
}

#[derive(Debug, Clone, Serialize)]
struct ContentsSpec {
    text: TextSpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TextSpec {
    include_html_tags: bool,
    max_characters: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl ExaClient {
    pub fn new(config: ExaConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { config, client })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, EnrichError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrichError::Api {
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| EnrichError::Malformed(err.to_string()))
    }

    /// Re-fetch page contents when the search payload came back truncated
    /// (no Experience section). Best match first, then the other matches;
    /// any failure here degrades silently to the original text.
    async fn fetch_full_text(&self, matches: &[SearchResult], best: usize) -> Option<String> {
        let order = std::iter::once(best).chain((0..matches.len()).filter(|&i| i != best));
        for idx in order {
            let url = matches[idx].url.as_str();
            let request = ContentsRequest {
                urls: vec![url],
                text: TextSpec {
                    include_html_tags: false,
                    max_characters: PROFILE_TEXT_MAX_CHARS,
                },
            };
            let response: SearchResponse = match self.post_json("/contents", &request).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(url, error = %err, "contents re-fetch failed");
                    return None;
                }
            };
            let full = response
                .results
                .into_iter()
                .filter_map(|r| r.text)
                .find(|t| t.contains(EXPERIENCE_HEADING));
            if let Some(text) = full {
                return Some(text);
            }
        }
        None
    }

    /// One extra quoted web search for the member's role at the configured
    /// organization, used when the LinkedIn text had none. Failures degrade
    /// silently to an empty field.
    async fn org_role_fallback(&self, fullname: &str) -> Option<String> {
        let org = self.config.org_name.trim();
        let query = format!("\"{fullname}\" \"{org}\"");
        let request = SearchRequest {
            query: &query,
            num_results: ORG_SEARCH_RESULT_COUNT,
            category: None,
            include_domains: None,
            contents: ContentsSpec {
                text: TextSpec {
                    include_html_tags: false,
                    max_characters: ORG_SEARCH_MAX_CHARS,
                },
            },
        };
        let response: SearchResponse = match self.post_json("/search", &request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(query, error = %err, "org role fallback search failed");
                return None;
            }
        };

        let first_name = fullname
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let org_lower = org.to_lowercase();
        for result in &response.results {
            let Some(text) = result.text.as_deref() else {
                continue;
            };
            let lower = text.to_lowercase();
            if lower.contains(&first_name) && lower.contains(&org_lower) {
                return Some(extract_org_role(text, org).unwrap_or_else(|| "Member".to_string()));
            }
        }
        None
    }
}

#[async_trait]
impl ProfileSearcher for ExaClient {
    async fn enrich(&self, member: &MemberRecord) -> Result<EnrichedRecord, EnrichError> {
        let name = search_name(member);
        let hint = self.config.search_hint.trim();
        let query = if hint.is_empty() {
            name.clone()
        } else {
            format!("{name} {hint}")
        };
        debug!(query, "searching for profile");

        let request = SearchRequest {
            query: &query,
            num_results: SEARCH_RESULT_COUNT,
            category: Some("people"),
            include_domains: Some(vec!["linkedin.com"]),
            contents: ContentsSpec {
                text: TextSpec {
                    include_html_tags: false,
                    max_characters: PROFILE_TEXT_MAX_CHARS,
                },
            },
        };
        let response: SearchResponse = self.post_json("/search", &request).await?;

        let matches: Vec<SearchResult> = response
            .results
            .into_iter()
            .filter(|r| name_matches(&name, &r.title, &r.url))
            .collect();
        if matches.is_empty() {
            return Err(EnrichError::NoMatch { query });
        }

        let best = pick_best(&matches, hint);
        let url = matches[best].url.clone();
        let mut text = matches[best].text.clone().unwrap_or_default();
        if !text.contains(EXPERIENCE_HEADING) {
            if let Some(full) = self.fetch_full_text(&matches, best).await {
                text = full;
            }
        }

        let mut facts = parse_profile_text(&text, &self.config.org_name);
        if facts.org_role_years.is_empty() && !self.config.org_name.trim().is_empty() {
            if let Some(role) = self.org_role_fallback(member.fullname_trimmed()).await {
                facts.org_role_years = role;
            }
        }

        Ok(EnrichedRecord::from_facts(member, url, facts))
    }
}

/// Name used in queries. Single-word fullnames get expanded from the email
/// local part or the username when either extends the first name (e.g.
/// `Leland` + `lelandlee4@…` becomes `Leland Lee`).
pub fn search_name(member: &MemberRecord) -> String {
    let fullname = member.fullname_trimmed();
    if fullname.contains(' ') {
        return fullname.to_string();
    }

    let email_prefix = member.email_trimmed().split('@').next().unwrap_or_default();
    let username = member.username_trimmed();
    let first_lower = fullname.to_lowercase();

    for source in [email_prefix, username] {
        let source_lower = source.to_lowercase();
        let source_lower = source_lower.trim_end_matches(|c: char| c.is_ascii_digit());
        if source_lower.starts_with(&first_lower) && source_lower.len() > first_lower.len() {
            let rest = &source_lower[first_lower.len()..];
            if rest.len() > 1 && rest.chars().all(char::is_alphabetic) {
                return format!("{fullname} {}", capitalize(rest));
            }
        }
    }

    if username.len() > 2
        && username.to_lowercase() != first_lower
        && username.chars().all(char::is_alphabetic)
    {
        return format!("{fullname} {}", capitalize(&username.to_lowercase()));
    }

    fullname.to_string()
}

/// A result counts as a match when the first name appears in its title and
/// the last name appears in the title or the URL slug (handles titles like
/// "Ashvin N." with url `/ashvinnihalani`).
pub fn name_matches(fullname: &str, title: &str, url: &str) -> bool {
    let name_lower = fullname.to_lowercase();
    let parts: Vec<&str> = name_lower.split_whitespace().collect();
    let Some(first) = parts.first() else {
        return false;
    };
    let title_lower = title.to_lowercase();
    let url_lower = url.to_lowercase();

    let first_in = title_lower.contains(first);
    let last_in = match parts.last() {
        Some(last) if parts.len() > 1 => {
            title_lower.contains(last) || url_lower.contains(last)
        }
        _ => true,
    };
    first_in && last_in
}

/// Among name matches, prefer the first whose profile text mentions the
/// search hint; otherwise keep search order.
fn pick_best(matches: &[SearchResult], hint: &str) -> usize {
    let hint = hint.trim().to_lowercase();
    if hint.is_empty() {
        return 0;
    }
    matches
        .iter()
        .position(|r| {
            r.text
                .as_deref()
                .map(|t| t.to_lowercase().contains(&hint))
                .unwrap_or(false)
        })
        .unwrap_or(0)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            let mut out = String::new();
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
            out
        }
        None => String::new(),
    }
}

fn current_role_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"###\s+(.+?)\s+at\s+(?:\[([^\]]+)\](?:<[^>]*>|\([^)]*\))|([^\n(]+))\s*\(Current\)",
        )
        .expect("valid pattern")
    })
}

fn first_role_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"###\s+(.+?)\s+at\s+(?:\[([^\]]+)\](?:<[^>]*>|\([^)]*\))|([^\n(]+))")
            .expect("valid pattern")
    })
}

fn audience_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)connections|followers").expect("valid pattern"))
}

fn location_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([A-Z]{2}\)\s*$").expect("valid pattern"))
}

fn location_city_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][a-z]+.*,\s*[A-Z]").expect("valid pattern"))
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"###\s+(.+)").expect("valid pattern"))
}

fn markdown_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]").expect("valid pattern"))
}

fn strip_markdown_link(heading: &str) -> String {
    match markdown_link_re().captures(heading) {
        Some(caps) => caps[1].trim().to_string(),
        None => heading.trim().to_string(),
    }
}

fn role_capture(caps: &regex::Captures<'_>) -> (String, String) {
    let title = caps[1].trim().to_string();
    let company = caps
        .get(2)
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().trim())
        .unwrap_or_default();
    let company = company.trim_end_matches("(Current)").trim().to_string();
    (title, company)
}

/// Extract structured facts from an Exa LinkedIn profile text dump. Every
/// field degrades to empty when its section is missing.
pub fn parse_profile_text(text: &str, org_name: &str) -> ProfileFacts {
    if text.trim().is_empty() {
        return ProfileFacts::default();
    }
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    // Headline sits on the second non-empty line, right after the name.
    let headline = lines.get(1).copied().unwrap_or_default().to_string();

    let (title, company) = match current_role_re().captures(text) {
        Some(caps) => role_capture(&caps),
        None => match text.find(EXPERIENCE_HEADING) {
            Some(pos) => first_role_re()
                .captures(&text[pos..])
                .map(|caps| role_capture(&caps))
                .unwrap_or_default(),
            None => Default::default(),
        },
    };

    // LinkedIn renders "City, State, Country (XX)" shortly before the
    // connections line.
    let mut location = String::new();
    for line in lines.iter().skip(2).take(4) {
        if audience_line_re().is_match(line) {
            break;
        }
        if location_code_re().is_match(line) {
            location = location_code_re().replace(line, "").trim().to_string();
            break;
        }
        if location_city_re().is_match(line) && !line.contains("at ") && !line.contains("##") {
            location = line.to_string();
            break;
        }
    }

    let education = match text.find(EDUCATION_HEADING) {
        Some(pos) => heading_re()
            .captures(&text[pos..])
            .map(|caps| strip_markdown_link(&caps[1]))
            .unwrap_or_default(),
        None => String::new(),
    };

    let org_role_years = org_roles_from_text(text, org_name);

    ProfileFacts {
        title,
        company,
        headline,
        location,
        education,
        org_role_years,
    }
}

/// Roles held at the configured organization, joined with " / ", plus the
/// earliest-start to latest-end date span. Profile text separates a role
/// heading from its date line with blank lines, hence the lazy any-char
/// bridge in the pattern.
pub fn org_roles_from_text(text: &str, org_name: &str) -> String {
    let org = org_name.trim();
    if org.is_empty() {
        return String::new();
    }
    let pattern = format!(
        r"###\s+(.+?)\s+at\s+(?:\[)?{}(?:\])?(?:<[^>]*>|\([^)]*\))?[\s\S]*?(\w+\s+\d{{4}})\s*-\s*((?:\w+\s+\d{{4}})|Present)",
        regex::escape(org)
    );
    let re = Regex::new(&pattern).expect("escaped org pattern");

    let mut roles = Vec::new();
    let mut spans = Vec::new();
    for caps in re.captures_iter(text) {
        roles.push(caps[1].trim().to_string());
        spans.push((caps[2].to_string(), caps[3].to_string()));
    }
    if roles.is_empty() {
        return String::new();
    }

    // Experience lists newest first, so the date range runs from the last
    // match's start to the first match's end.
    let start = &spans[spans.len() - 1].0;
    let end = &spans[0].1;
    format!("{}, {} - {}", roles.join(" / "), start, end)
}

/// Pull a role word out of web text mentioning the organization, e.g.
/// "Editor of Blockchain at Berkeley". Returns None when only a generic
/// word (or nothing) precedes the organization name.
pub fn extract_org_role(text: &str, org_name: &str) -> Option<String> {
    let org = org_name.trim();
    if org.is_empty() {
        return None;
    }
    let pattern = format!(
        r"(?i)(?:([\w][\w\s]+?)\s+(?:of|at|for)\s+)?{}",
        regex::escape(org)
    );
    let re = Regex::new(&pattern).expect("escaped org pattern");
    let caps = re.captures(text)?;
    let role = caps.get(1)?.as_str().trim();
    let generic = ["member", "the", "about", "from", "and", "with"];
    if generic.contains(&role.to_lowercase().as_str()) {
        return None;
    }
    Some(role.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PROFILE: &str = "\
Ada Lovelace
Software Engineer at Acme Corp
San Francisco, California, United States (US)
500+ connections

## Experience

### Software Engineer at [Acme Corp](https://acme.example) (Current)

Jan 2023 - Present

### Consultant at [Blockchain at Berkeley](https://example.org/bab)

Sep 2019 - May 2021

### Analyst at Blockchain at Berkeley

Jan 2018 - Aug 2019

## Education

### [University of California, Berkeley](https://berkeley.edu)
";

    fn member(fullname: &str, email: &str, username: Option<&str>) -> MemberRecord {
        MemberRecord {
            fullname: fullname.to_string(),
            email: email.to_string(),
            username: username.map(ToString::to_string),
        }
    }

    #[test]
    fn search_name_passes_full_names_through() {
        let m = member("Ada Lovelace", "ada@example.org", Some("ada"));
        assert_eq!(search_name(&m), "Ada Lovelace");
    }

    #[test]
    fn search_name_expands_from_email_prefix() {
        let m = member("Leland", "lelandlee4@gmail.com", None);
        assert_eq!(search_name(&m), "Leland Lee");
    }

    #[test]
    fn search_name_uses_username_as_last_name() {
        let m = member("Ashvin", "ashvin@example.org", Some("nihalani"));
        assert_eq!(search_name(&m), "Ashvin Nihalani");
    }

    #[test]
    fn search_name_gives_up_on_unhelpful_sources() {
        let m = member("Ada", "ada@example.org", Some("ada"));
        assert_eq!(search_name(&m), "Ada");
    }

    #[test]
    fn name_matches_accepts_last_name_in_url_slug() {
        assert!(name_matches(
            "Ashvin Nihalani",
            "Ashvin N. - Engineer",
            "https://linkedin.com/in/ashvinnihalani"
        ));
    }

    #[test]
    fn name_matches_requires_the_first_name_in_the_title() {
        assert!(!name_matches(
            "Ada Lovelace",
            "Grace Hopper - Rear Admiral",
            "https://linkedin.com/in/lovelace"
        ));
        assert!(name_matches(
            "Ada Lovelace",
            "Ada Lovelace - Analyst",
            "https://linkedin.com/in/ada"
        ));
    }

    #[test]
    fn pick_best_prefers_hint_mentions() {
        let matches = vec![
            SearchResult {
                title: "Ada Lovelace".into(),
                url: "https://linkedin.com/in/ada1".into(),
                text: Some("profile without the magic word".into()),
            },
            SearchResult {
                title: "Ada Lovelace".into(),
                url: "https://linkedin.com/in/ada2".into(),
                text: Some("studied at Berkeley".into()),
            },
        ];
        assert_eq!(pick_best(&matches, "Berkeley"), 1);
        assert_eq!(pick_best(&matches, ""), 0);
    }

    #[test]
    fn parse_extracts_current_role_headline_and_location() {
        let facts = parse_profile_text(SAMPLE_PROFILE, "");
        assert_eq!(facts.title, "Software Engineer");
        assert_eq!(facts.company, "Acme Corp");
        assert_eq!(facts.headline, "Software Engineer at Acme Corp");
        assert_eq!(facts.location, "San Francisco, California, United States");
        assert_eq!(facts.education, "University of California, Berkeley");
        assert_eq!(facts.org_role_years, "");
    }

    #[test]
    fn parse_collects_org_roles_with_date_span() {
        let facts = parse_profile_text(SAMPLE_PROFILE, "Blockchain at Berkeley");
        assert_eq!(
            facts.org_role_years,
            "Consultant / Analyst, Jan 2018 - May 2021"
        );
    }

    #[test]
    fn parse_falls_back_to_first_experience_role() {
        let text = "\
Grace Hopper
Computer scientist
New Haven, Connecticut, United States (US)

## Experience

### Rear Admiral at United States Navy

Jun 1943 - Aug 1986
";
        let facts = parse_profile_text(text, "");
        assert_eq!(facts.title, "Rear Admiral");
        assert_eq!(facts.company, "United States Navy");
    }

    #[test]
    fn parse_accepts_bare_city_state_location() {
        let text = "\
Ada Lovelace
Analyst
London, England
200 followers
";
        let facts = parse_profile_text(text, "");
        assert_eq!(facts.location, "London, England");
    }

    #[test]
    fn parse_of_empty_text_yields_empty_facts() {
        assert_eq!(parse_profile_text("", "Some Org"), ProfileFacts::default());
    }

    #[test]
    fn extract_org_role_finds_specific_roles_and_drops_generic_ones() {
        let org = "Blockchain at Berkeley";
        assert_eq!(
            extract_org_role("Editor of Blockchain at Berkeley since 2019", org),
            Some("Editor".to_string())
        );
        assert_eq!(extract_org_role("Member of Blockchain at Berkeley", org), None);
        assert_eq!(extract_org_role("unrelated text entirely", org), None);
    }

    #[test]
    fn search_request_serializes_the_exa_wire_shape() {
        let request = SearchRequest {
            query: "Ada Lovelace Berkeley",
            num_results: SEARCH_RESULT_COUNT,
            category: Some("people"),
            include_domains: Some(vec!["linkedin.com"]),
            contents: ContentsSpec {
                text: TextSpec {
                    include_html_tags: false,
                    max_characters: PROFILE_TEXT_MAX_CHARS,
                },
            },
        };
        let value = serde_json::to_value(&request).expect("serialize request");
        assert_eq!(value["numResults"], 5);
        assert_eq!(value["category"], "people");
        assert_eq!(value["includeDomains"][0], "linkedin.com");
        assert_eq!(value["contents"]["text"]["maxCharacters"], 10_000);
        assert_eq!(value["contents"]["text"]["includeHtmlTags"], false);
    }

    #[test]
    fn search_response_tolerates_missing_fields() {
        let raw = r#"{"results":[{"url":"https://linkedin.com/in/ada","title":"Ada Lovelace - Analyst"},{"title":"no url"}],"requestId":"abc"}"#;
        let response: SearchResponse = serde_json::from_str(raw).expect("parse response");
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].url, "https://linkedin.com/in/ada");
        assert_eq!(response.results[0].text, None);
        assert_eq!(response.results[1].url, "");
    }
}
