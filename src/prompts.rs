//! Persona prompt templates for analysis units.
//!
//! Domain logic for rendering analysis prompts. Provider-agnostic; the
//! persona *content* is configuration-grade data, not engine logic.

// =============================================================================
// Rendered prompts
// =============================================================================

/// Rendered prompt ready for the gateway.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub persona_slug: String,
    pub system: String,
    pub user: String,
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Persona templates
// =============================================================================

/// A persona template with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PersonaTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PersonaTemplate {
    /// Render a unit prompt. `prior_context` is the bounded excerpt of
    /// context memory from dependency units, already truncated by the
    /// caller; empty means no context block is emitted.
    pub fn render(&self, query: &str, focus: &str, prior_context: &str) -> PromptInstance {
        let safe_query = escape_xml_chars(query);
        let safe_focus = escape_xml_chars(focus);

        let user_core = self
            .user
            .replace("{query}", &safe_query)
            .replace("{focus}", &safe_focus);

        let mut parts: Vec<String> = Vec::new();
        if !prior_context.trim().is_empty() {
            parts.push(format!(
                "<prior_findings>\n{}\n</prior_findings>",
                escape_xml_chars(prior_context.trim())
            ));
        }
        parts.push(user_core.trim().to_string());

        PromptInstance {
            persona_slug: self.slug.to_string(),
            system: self.system.trim().to_string(),
            user: parts.join("\n\n"),
        }
    }
}

// =============================================================================
// Standard personas
// =============================================================================

pub const CONSUMER_INSIGHTS: PersonaTemplate = PersonaTemplate {
    slug: "consumer_insights",
    system: r#"You are a consumer insights analyst. You assess consumer demand, behavior, loyalty, and sentiment for a business opportunity. Ground every claim in plausible consumer evidence and always quantify: state percentages, ratings out of 5, or an explicit strength word (very strong / strong / moderate / weak / very weak)."#,
    user: r#"Strategic question:
<query>
{query}
</query>

Analyze: {focus}.

Give a concise assessment (under 300 words) with explicit numbers where possible."#,
};

pub const MARKET_RESEARCH: PersonaTemplate = PersonaTemplate {
    slug: "market_research",
    system: r#"You are a market research analyst. You size markets and quantify growth. Always state market sizes in USD with a magnitude suffix (million / billion / trillion) and growth rates as percentages, e.g. "a $4.2 billion market growing at 12% annually"."#,
    user: r#"Strategic question:
<query>
{query}
</query>

Analyze: {focus}.

Give a concise assessment (under 300 words) with explicit figures."#,
};

pub const COMPETITOR_ANALYSIS: PersonaTemplate = PersonaTemplate {
    slug: "competitor_analysis",
    system: r#"You are a competitive intelligence analyst. You evaluate differentiation, threats, and barriers to entry. Rate each dimension you discuss out of 5 or with an explicit strength word (very strong / strong / moderate / weak / very weak)."#,
    user: r#"Strategic question:
<query>
{query}
</query>

Analyze: {focus}.

Give a concise assessment (under 300 words) with explicit ratings."#,
};

pub const TREND_ANALYSIS: PersonaTemplate = PersonaTemplate {
    slug: "trend_analysis",
    system: r#"You are a trend analyst. You assess trajectories, adoption curves, and macro exposure. Quantify: percentages for adoption and engagement, ratings out of 5 for qualitative dimensions, explicit strength words otherwise."#,
    user: r#"Strategic question:
<query>
{query}
</query>

Analyze: {focus}.

Give a concise assessment (under 300 words) with explicit numbers."#,
};

pub const PRICING_RESEARCH: PersonaTemplate = PersonaTemplate {
    slug: "pricing_research",
    system: r#"You are a pricing analyst. You evaluate pricing power, willingness to pay, and value perception. Rate pricing power out of 5 and quantify price premiums or discounts as percentages."#,
    user: r#"Strategic question:
<query>
{query}
</query>

Analyze: {focus}.

Give a concise assessment (under 300 words) with explicit ratings."#,
};

pub const PERSONAS: &[PersonaTemplate] = &[
    CONSUMER_INSIGHTS,
    MARKET_RESEARCH,
    COMPETITOR_ANALYSIS,
    TREND_ANALYSIS,
    PRICING_RESEARCH,
];

pub const DEFAULT_PERSONA: PersonaTemplate = MARKET_RESEARCH;

pub fn persona_by_slug(slug: &str) -> Option<PersonaTemplate> {
    PERSONAS.iter().find(|t| t.slug == slug).copied()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_render() {
        let p = MARKET_RESEARCH.render("Should we enter the EV market?", "market size", "");
        assert!(p.system.contains("market research"));
        assert!(p.user.contains("EV market"));
        assert!(p.user.contains("market size"));
        assert!(!p.user.contains("<prior_findings>"));
    }

    #[test]
    fn persona_with_prior_context() {
        let p = COMPETITOR_ANALYSIS.render("q", "threats", "market_size: $3B TAM");
        assert!(p.user.contains("<prior_findings>"));
        assert!(p.user.contains("$3B TAM"));
    }

    #[test]
    fn persona_lookup() {
        assert!(persona_by_slug("consumer_insights").is_some());
        assert!(persona_by_slug("pricing_research").is_some());
        assert!(persona_by_slug("nonexistent").is_none());
    }

    #[test]
    fn xml_escaping() {
        let p = MARKET_RESEARCH.render("<query>break</query>", "focus", "<x>ctx</x>");
        assert!(p.user.contains("&lt;query&gt;"));
        assert!(p.user.contains("&lt;x&gt;"));
    }
}
