//! Research contexts and the site filters they impose on web search.
//!
//! A [`ResearchContext`] is one of a fixed set of Microsoft technology domains.
//! [`scope`] turns a selection of contexts into a [`SiteFilters`] value that the
//! search provider applies; an empty selection means unrestricted search.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Technology domain a user can restrict research to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResearchContext {
    AzureAi,
    Fabric,
    CopilotStudio,
    M365Copilot,
}

impl ResearchContext {
    pub const ALL: [ResearchContext; 4] = [
        ResearchContext::AzureAi,
        ResearchContext::Fabric,
        ResearchContext::CopilotStudio,
        ResearchContext::M365Copilot,
    ];

    /// Short label shown in selection lists.
    pub fn label(&self) -> &'static str {
        match self {
            ResearchContext::AzureAi => "Azure AI",
            ResearchContext::Fabric => "Fabric",
            ResearchContext::CopilotStudio => "Copilot Studio",
            ResearchContext::M365Copilot => "M365 Copilot",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            ResearchContext::AzureAi => "azure-ai",
            ResearchContext::Fabric => "fabric",
            ResearchContext::CopilotStudio => "copilot-studio",
            ResearchContext::M365Copilot => "m365-copilot",
        }
    }

    /// Product name used inside agent instructions.
    pub fn display_name(&self) -> &'static str {
        match self {
            ResearchContext::AzureAi => "Microsoft Azure AI",
            ResearchContext::Fabric => "Microsoft Fabric",
            ResearchContext::CopilotStudio => "Microsoft Copilot Studio",
            ResearchContext::M365Copilot => "Microsoft 365 Copilot",
        }
    }

    /// Documentation prefixes that results must fall under.
    pub fn url_prefixes(&self) -> &'static [&'static str] {
        match self {
            ResearchContext::AzureAi => &["https://learn.microsoft.com/en-us/azure"],
            ResearchContext::Fabric => &["https://learn.microsoft.com/en-us/fabric/"],
            ResearchContext::CopilotStudio => {
                &["https://learn.microsoft.com/en-us/microsoft-copilot-studio/"]
            }
            ResearchContext::M365Copilot => {
                &["https://learn.microsoft.com/en-us/copilot/microsoft-365/"]
            }
        }
    }

    /// Parse a list of labels, silently dropping anything unknown.
    pub fn parse_all<I, S>(labels: I) -> BTreeSet<ResearchContext>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        labels
            .into_iter()
            .filter_map(|label| label.as_ref().parse().ok())
            .collect()
    }
}

impl fmt::Display for ResearchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownContext(pub String);

impl fmt::Display for UnknownContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown research context `{}`", self.0)
    }
}

impl std::error::Error for UnknownContext {}

impl FromStr for ResearchContext {
    type Err = UnknownContext;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized: String = input
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        ResearchContext::ALL
            .into_iter()
            .find(|ctx| {
                let label: String = ctx
                    .label()
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .map(|c| c.to_ascii_lowercase())
                    .collect();
                label == normalized
            })
            .ok_or_else(|| UnknownContext(input.to_string()))
    }
}

/// URL-prefix constraints for a search call. Empty means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFilters {
    prefixes: BTreeSet<String>,
}

impl SiteFilters {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }

    pub fn allows(&self, url: &str) -> bool {
        self.is_unrestricted() || self.prefixes.iter().any(|prefix| url.starts_with(prefix))
    }

    /// Render as a `site:` clause, e.g. `site:learn.microsoft.com/en-us/fabric/ OR site:...`.
    pub fn to_query_clause(&self) -> Option<String> {
        if self.is_unrestricted() {
            return None;
        }
        let clause = self
            .prefixes
            .iter()
            .map(|prefix| {
                let bare = prefix
                    .strip_prefix("https://")
                    .or_else(|| prefix.strip_prefix("http://"))
                    .unwrap_or(prefix);
                format!("site:{bare}")
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        Some(clause)
    }
}

/// Compute the site filters for a selection of research contexts.
pub fn scope<'a, I>(selected: I) -> SiteFilters
where
    I: IntoIterator<Item = &'a ResearchContext>,
{
    let prefixes = selected
        .into_iter()
        .flat_map(|ctx| ctx.url_prefixes().iter().map(|prefix| prefix.to_string()))
        .collect();
    SiteFilters { prefixes }
}

/// Human phrase naming the selected products, used to focus agent instructions.
pub fn focus_phrase(selected: &BTreeSet<ResearchContext>) -> String {
    let names: Vec<&str> = selected.iter().map(|ctx| ctx.display_name()).collect();
    match names.as_slice() {
        [] => "Microsoft Technology".to_string(),
        [only] => only.to_string(),
        [first, second] => format!("{first} and {second}"),
        [head @ .., last] => format!("{}, and {last}", head.join(", ")),
    }
}
