//! The sales-methodology rubric sent to the judge.
//!
//! Everything here is static text. The only input is the normalized
//! transcript, so the same transcript always yields the same bytes.

use pitchscore_schema::Dimension;

pub struct RubricSection {
    pub dimension: Dimension,
    /// What the evaluator is told to look at, e.g. "discovery skills"
    pub subject: &'static str,
    pub signals: &'static [&'static str],
}

pub const RUBRIC: [RubricSection; 5] = [
    RubricSection {
        dimension: Dimension::Opening,
        subject: "opening",
        signals: &[
            "Professional greeting and introduction",
            "Clear purpose statement",
            "Permission-based approach (asking for time)",
            "Rapport building",
            "Energy and confidence",
            "Value proposition teaser",
            "Setting expectations",
        ],
    },
    RubricSection {
        dimension: Dimension::Discovery,
        subject: "discovery skills",
        signals: &[
            "Quality of questions asked (open-ended vs closed)",
            "Depth of needs assessment",
            "Understanding client's pain points",
            "Identifying decision-making process",
            "Budget and timeline discovery",
            "Competitive landscape awareness",
            "Active listening and follow-up questions",
            "Building trust and credibility",
        ],
    },
    RubricSection {
        dimension: Dimension::Presentation,
        subject: "presentation skills",
        signals: &[
            "Relevance to client's specific needs",
            "Clear value proposition",
            "Benefit-focused messaging",
            "Use of examples and stories",
            "Handling of features vs benefits",
            "Addressing client concerns",
            "Professional delivery",
            "Engagement techniques",
        ],
    },
    RubricSection {
        dimension: Dimension::ObjectionHandling,
        subject: "objection handling",
        signals: &[
            "Acknowledgment of concerns",
            "Probing for root causes",
            "Providing relevant solutions",
            "Using proof points and testimonials",
            "Maintaining positive attitude",
            "Not being defensive",
            "Turning objections into opportunities",
            "Building consensus",
        ],
    },
    RubricSection {
        dimension: Dimension::Closing,
        subject: "closing skills",
        signals: &[
            "Identifying buying signals",
            "Asking for the business",
            "Creating appropriate urgency",
            "Summarizing value",
            "Handling final concerns",
            "Securing next steps",
            "Professional persistence",
            "Clear call-to-action",
        ],
    },
];

/// Score bands, highest first.
pub const SCORING_BANDS: [(&str, &str); 5] = [
    ("9-10", "Exceptional performance, exceeds expectations"),
    ("7-8", "Good performance, meets most expectations"),
    ("5-6", "Average performance, room for improvement"),
    ("3-4", "Below average, significant improvement needed"),
    ("0-2", "Poor performance, major issues to address"),
];

const PERSONA: &str = "You are an expert sales trainer and performance evaluator with 20+ years of experience in sales training and coaching. You are analyzing a sales conversation to provide a comprehensive evaluation based on modern sales methodologies and best practices.";

const CLOSING_GUIDANCE: &str = "Consider the conversation flow, client engagement, and overall sales effectiveness. Be fair but honest in your evaluation.";

const OUTPUT_CONTRACT: &str = r#"Return your evaluation as a JSON object with this exact format:
{
  "opening": [number 0-10],
  "discovery": [number 0-10],
  "presentation": [number 0-10],
  "objectionHandling": [number 0-10],
  "closing": [number 0-10],
  "totalScore": [sum of all scores],
  "maxPossibleScore": 50,
  "feedback": "[Provide detailed, constructive feedback highlighting specific strengths and areas for improvement. Be encouraging while being honest about areas for growth. Use 'you' instead of 'the salesperson' throughout the feedback. Focus on actionable advice.]"
}"#;

/// Render the full judge instruction for a normalized transcript.
pub fn build_prompt(transcript: &str) -> String {
    let mut prompt = String::with_capacity(4096 + transcript.len());

    prompt.push_str(PERSONA);
    prompt.push_str("\n\nCONVERSATION TO ANALYZE:\n\n");
    prompt.push_str(transcript);
    prompt.push_str(
        "\n\nEVALUATION CRITERIA - Rate each category from 0-10 based on sales effectiveness:\n\n",
    );

    let sections: Vec<String> = RUBRIC
        .iter()
        .enumerate()
        .map(|(index, section)| render_section(index + 1, section))
        .collect();
    prompt.push_str(&sections.join("\n\n"));

    prompt.push_str("\n\nSCORING GUIDELINES:\n");
    let bands: Vec<String> = SCORING_BANDS
        .iter()
        .map(|(range, meaning)| format!("- {range}: {meaning}"))
        .collect();
    prompt.push_str(&bands.join("\n"));

    prompt.push_str("\n\n");
    prompt.push_str(CLOSING_GUIDANCE);
    prompt.push_str("\n\n");
    prompt.push_str(OUTPUT_CONTRACT);
    prompt
}

fn render_section(number: usize, section: &RubricSection) -> String {
    let mut text = format!(
        "{number}. {} (0-10 points):\nEvaluate the salesperson's {} based on:",
        section.dimension.title(),
        section.subject
    );
    for signal in section.signals {
        text.push_str("\n- ");
        text.push_str(signal);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = "user: Hello, calling about our product.\nassistant: Tell me more.";

    #[test]
    fn same_transcript_same_bytes() {
        assert_eq!(build_prompt(TRANSCRIPT), build_prompt(TRANSCRIPT));
    }

    #[test]
    fn different_transcripts_differ_only_in_transcript() {
        let a = build_prompt("user: a");
        let b = build_prompt("user: b");
        assert_ne!(a, b);
        assert_eq!(a.replace("user: a", "user: b"), b);
    }

    #[test]
    fn sections_follow_rubric_order() {
        let prompt = build_prompt(TRANSCRIPT);
        let positions: Vec<usize> = [
            "1. OPENING (0-10 points):",
            "2. DISCOVERY (0-10 points):",
            "3. PRESENTATION (0-10 points):",
            "4. OBJECTION HANDLING (0-10 points):",
            "5. CLOSING (0-10 points):",
            "SCORING GUIDELINES:",
            "Return your evaluation as a JSON object",
        ]
        .iter()
        .map(|needle| prompt.find(needle).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn transcript_sits_between_persona_and_criteria() {
        let prompt = build_prompt(TRANSCRIPT);
        let persona = prompt.find("You are an expert sales trainer").unwrap();
        let transcript = prompt.find(TRANSCRIPT).unwrap();
        let criteria = prompt.find("EVALUATION CRITERIA").unwrap();
        assert_eq!(persona, 0);
        assert!(persona < transcript && transcript < criteria);
    }

    #[test]
    fn output_contract_names_every_field() {
        let prompt = build_prompt(TRANSCRIPT);
        for dimension in Dimension::ALL {
            assert!(prompt.contains(&format!("\"{}\": [number 0-10]", dimension.field_name())));
        }
        assert!(prompt.contains("\"totalScore\""));
        assert!(prompt.contains("\"maxPossibleScore\": 50"));
        assert!(prompt.contains("\"feedback\""));
    }

    #[test]
    fn section_lists_its_signals() {
        let text = render_section(4, &RUBRIC[3]);
        assert!(text.starts_with(
            "4. OBJECTION HANDLING (0-10 points):\nEvaluate the salesperson's objection handling based on:\n- Acknowledgment of concerns"
        ));
        assert_eq!(text.matches("\n- ").count(), 8);
    }

    #[test]
    fn rubric_covers_each_dimension_once() {
        let dimensions: Vec<Dimension> = RUBRIC.iter().map(|s| s.dimension).collect();
        assert_eq!(dimensions, Dimension::ALL.to_vec());
    }
}
