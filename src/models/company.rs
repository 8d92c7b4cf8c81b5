use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optional enrichment attributes. Everything here is nullable on the
/// schema; call sites never have to fabricate defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyMetadata {
    pub tech_stack: Vec<String>,
    pub pricing_model: Option<String>,
    pub company_size: Option<String>,
    pub founding_year: Option<i32>,
    pub features: Vec<String>,
    pub use_cases: Vec<String>,
    pub integrations: Vec<String>,
    pub certifications: Vec<String>,
}

/// Immutable input to an audit. The engine never mutates the company row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub id: Uuid,
    pub name: String,
    pub domain: Option<String>,
    pub industry: Option<String>,
    pub sub_industry: Option<String>,
    pub description: Option<String>,
    pub original_description: Option<String>,
    /// Post-onboarding description confirmed by the user; preferred over
    /// everything else so enrichment never shadows user-authored text.
    pub final_description: Option<String>,
    pub value_props: Vec<String>,
    pub audiences: Vec<String>,
    pub competitors: Vec<String>,
    pub products: Vec<String>,
    pub pain_points: Vec<String>,
    pub geographies: Vec<String>,
    pub metadata: CompanyMetadata,
}

impl CompanyProfile {
    /// `final_description ?? original_description ?? description`.
    pub fn effective_description(&self) -> Option<&str> {
        [&self.final_description, &self.original_description, &self.description]
            .into_iter()
            .filter_map(|d| d.as_deref())
            .map(str::trim)
            .find(|d| !d.is_empty())
    }

    /// An audit needs at minimum a name and some description to prompt from.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("company name is empty".to_string());
        }
        if self.effective_description().is_none() {
            return Err(format!("company {} has no usable description", self.id));
        }
        Ok(())
    }

    /// Name plus spelling variants the brand matcher should count.
    pub fn brand_aliases(&self) -> Vec<String> {
        let name = self.name.trim();
        let mut aliases = vec![name.to_string()];

        // "Acme Inc." / "Acme Labs, Inc" → also match the bare "Acme".
        for suffix in [" inc", " inc.", " llc", " ltd", " ltd.", " labs", " co.", " corp", " corp."] {
            if name.len() > suffix.len()
                && name.is_char_boundary(name.len() - suffix.len())
                && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
            {
                let bare = name[..name.len() - suffix.len()].trim_end_matches([',', ' ']).to_string();
                if !bare.is_empty() && !aliases.iter().any(|a| a.eq_ignore_ascii_case(&bare)) {
                    aliases.push(bare);
                }
            }
        }
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CompanyProfile {
        CompanyProfile {
            id: Uuid::nil(),
            name: "Acme".into(),
            domain: Some("acme.com".into()),
            industry: Some("DevTools".into()),
            sub_industry: None,
            description: Some("enriched".into()),
            original_description: Some("original".into()),
            final_description: Some("final".into()),
            value_props: vec![],
            audiences: vec![],
            competitors: vec![],
            products: vec![],
            pain_points: vec![],
            geographies: vec![],
            metadata: CompanyMetadata::default(),
        }
    }

    #[test]
    fn description_prefers_user_authored() {
        let mut p = profile();
        assert_eq!(p.effective_description(), Some("final"));
        p.final_description = None;
        assert_eq!(p.effective_description(), Some("original"));
        p.original_description = Some("   ".into());
        assert_eq!(p.effective_description(), Some("enriched"));
        p.description = None;
        assert_eq!(p.effective_description(), None);
    }

    #[test]
    fn validate_rejects_nameless_or_descriptionless() {
        let mut p = profile();
        p.name = "  ".into();
        assert!(p.validate().is_err());

        let mut p = profile();
        p.final_description = None;
        p.original_description = None;
        p.description = None;
        assert!(p.validate().is_err());
    }

    #[test]
    fn aliases_strip_corporate_suffixes() {
        let mut p = profile();
        p.name = "Globex Corp".into();
        let aliases = p.brand_aliases();
        assert!(aliases.contains(&"Globex Corp".to_string()));
        assert!(aliases.contains(&"Globex".to_string()));
    }
}
