use crate::config::AdvisorConfig;
use crate::dimensions::Dimension;

fn output_contract() -> String {
    let mut dims = String::new();
    for dim in Dimension::ALL {
        dims.push_str(&format!(
            "    \"{}\": {{\"score\": <0-10>, \"comment\": \"...\", \"recommendation\": \"...\"}},\n",
            dim.as_str()
        ));
    }
    let dims = dims.trim_end_matches(",\n");

    format!(
        "Return ONLY a JSON object, no other text, in this exact shape:\n\
         {{\n\
         \x20 \"image_description\": \"<one paragraph describing the photograph>\",\n\
         \x20 \"dimensions\": {{\n{}\n  }},\n\
         \x20 \"overall_score\": <0-10>,\n\
         \x20 \"recommendations\": [\"...\"]\n\
         }}",
        dims
    )
}

/// Full prompt for one critique. `context` is the rendered retrieval block,
/// present only for retrieval modes.
pub fn build_prompt(advisor: &AdvisorConfig, context: Option<&str>) -> String {
    let mut prompt = String::new();

    if !advisor.persona.trim().is_empty() {
        prompt.push_str(advisor.persona.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "Critique this photograph as {} would. Score each of these dimensions from 0 to 10:\n",
        advisor.display_name()
    ));
    for dim in Dimension::ALL {
        prompt.push_str(&format!("- {} ({})\n", dim.display_name(), dim.as_str()));
    }

    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\nReference material from your own body of work:\n");
        prompt.push_str(context.trim());
        prompt.push_str(
            "\n\nGround your comments in this material where it applies, \
             but score only what you see in the submitted photograph.\n",
        );
    }

    prompt.push('\n');
    prompt.push_str(&output_contract());
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advisor() -> AdvisorConfig {
        AdvisorConfig {
            id: "adams".into(),
            name: Some("Ansel Adams".into()),
            persona: "You are Ansel Adams, master of the Zone System.".into(),
        }
    }

    #[test]
    fn test_prompt_lists_every_dimension_and_persona() {
        let prompt = build_prompt(&advisor(), None);
        assert!(prompt.starts_with("You are Ansel Adams"));
        assert!(prompt.contains("as Ansel Adams would"));
        for dim in Dimension::ALL {
            assert!(prompt.contains(&format!("\"{}\": {{\"score\"", dim.as_str())));
        }
        assert!(!prompt.contains("Reference material"));
    }

    #[test]
    fn test_context_block_only_when_present() {
        let prompt = build_prompt(&advisor(), Some("[1] Moonrise, Hernandez"));
        assert!(prompt.contains("Reference material"));
        assert!(prompt.contains("Moonrise, Hernandez"));

        let blank = build_prompt(&advisor(), Some("   "));
        assert!(!blank.contains("Reference material"));
    }
}
