//! Request builders for each gated stage.
//!
//! Every stage has a writer request and a judge request. The judge is always
//! asked for the same JSON scorecard shape; only the criteria and the pass
//! line differ.

use crate::oracle::{EvaluateRequest, ProduceRequest};
use crate::state_machine::{Job, Phase, SubUnit};

/// Characters of the previous unit's content carried into the next prompt.
const CONTINUITY_TAIL_CHARS: usize = 1_200;

const EDITOR_SYSTEM: &str = "You are a meticulous fiction editor. You answer with a single JSON object and nothing else.";

struct Criterion {
    key: &'static str,
    question: &'static str,
}

const SETUP_CRITERIA: &[Criterion] = &[
    Criterion { key: "completeness", question: "does the setting cover every required element" },
    Criterion { key: "consistency", question: "do the elements agree with each other" },
    Criterion { key: "originality", question: "is there anything fresh or distinctive" },
    Criterion { key: "feasibility", question: "can it carry a complete story" },
    Criterion { key: "appeal", question: "would it draw a reader in" },
];

const OUTLINE_CRITERIA: &[Criterion] = &[
    Criterion { key: "structure", question: "does the story have a full arc" },
    Criterion { key: "logic", question: "do the chapters follow from one another" },
    Criterion { key: "pacing", question: "is the plot advanced at a sensible rate" },
    Criterion { key: "consistency", question: "does it respect the setting" },
    Criterion { key: "appeal", question: "is the plot engaging" },
];

const SUB_OUTLINE_CRITERIA: &[Criterion] = &[
    Criterion { key: "detail", question: "is the plan detailed enough" },
    Criterion { key: "executable", question: "could a writer draft the chapter from it" },
    Criterion { key: "consistency", question: "does it respect the setting and outline" },
    Criterion { key: "logic", question: "are the plot developments plausible" },
];

const CONTENT_CRITERIA: &[Criterion] = &[
    Criterion { key: "fidelity", question: "does the prose follow the chapter plan" },
    Criterion { key: "prose", question: "is the writing clear and vivid" },
    Criterion { key: "dialogue", question: "does the dialogue sound natural" },
    Criterion { key: "continuity", question: "does it connect with the previous chapter" },
    Criterion { key: "length", question: "is it close to the requested length" },
];

/// Shared context of the two gates run for one sub-unit.
#[derive(Debug, Clone, Copy)]
pub struct UnitContext<'a> {
    pub job: &'a Job,
    pub unit: &'a SubUnit,
    pub setup: &'a str,
    pub outline: &'a str,
    /// Accepted content of the unit just before this one.
    pub previous_content: Option<&'a str>,
}

pub fn setup_request(job: &Job) -> ProduceRequest {
    let spec = &job.spec;
    ProduceRequest {
        job_id: job.id.clone(),
        phase: Phase::Setup,
        unit: None,
        system_prompt: "You are an experienced story planner who builds compelling settings for novels.".into(),
        user_prompt: format!(
            "Create a complete setting for a novel.\n\n\
             Working title: {title}\n\
             Theme: {theme}\n\
             Background: {background}\n\
             Target length: {length} characters\n\
             Target chapters: {units}\n\n\
             Cover, each under its own heading:\n\
             1. Title\n\
             2. World and period\n\
             3. Main characters (three to five, with personality, history and motive)\n\
             4. Central conflict\n\
             5. Tone\n\
             6. Special rules of the world, if any",
            title = spec.title,
            theme = spec.theme,
            background = spec.background,
            length = spec.target_length,
            units = spec.target_units,
        ),
        temperature: 0.8,
        max_output_tokens: 3000,
    }
}

pub fn setup_check(job: &Job, setup: String, min_total: f64) -> EvaluateRequest {
    EvaluateRequest {
        job_id: job.id.clone(),
        phase: Phase::Setup,
        unit: None,
        system_prompt: EDITOR_SYSTEM.into(),
        rubric: rubric(
            &format!("Review this novel setting. The requested theme was: {}", job.spec.theme),
            SETUP_CRITERIA,
            min_total,
        ),
        material: format!("Setting:\n{setup}"),
        max_output_tokens: 1500,
    }
}

pub fn outline_request(job: &Job, setup: &str) -> ProduceRequest {
    ProduceRequest {
        job_id: job.id.clone(),
        phase: Phase::Outline,
        unit: None,
        system_prompt: "You are an experienced outliner who builds complete story structures.".into(),
        user_prompt: format!(
            "Write a chapter outline for the novel described below.\n\n\
             Setting:\n{setup}\n\n\
             Requirements:\n\
             - exactly {units} chapters\n\
             - every chapter has a clear title and a summary of about 200 words\n\
             - the story has a beginning, development, climax and ending\n\n\
             Use this format and nothing else:\n\
             Chapter 1: <title>\n\
             <summary>\n\
             Chapter 2: <title>\n\
             <summary>",
            units = job.spec.target_units,
        ),
        temperature: 0.7,
        max_output_tokens: 4000,
    }
}

pub fn outline_check(job: &Job, setup: &str, outline: String, min_total: f64) -> EvaluateRequest {
    EvaluateRequest {
        job_id: job.id.clone(),
        phase: Phase::Outline,
        unit: None,
        system_prompt: EDITOR_SYSTEM.into(),
        rubric: rubric(
            "Review this chapter outline against its setting.",
            OUTLINE_CRITERIA,
            min_total,
        ),
        material: format!("Setting:\n{setup}\n\nOutline:\n{outline}"),
        max_output_tokens: 1500,
    }
}

pub fn sub_outline_request(ctx: UnitContext<'_>) -> ProduceRequest {
    let unit = ctx.unit;
    let mut prompt = format!(
        "Expand one chapter of the outline into a detailed plan.\n\n\
         Setting:\n{setup}\n\n\
         Full outline:\n{outline}\n\n\
         Chapter {ordinal}: {title}\n{excerpt}\n\n\
         The chapter should run to about {length} characters. Cover scenes, \
         characters, key lines of dialogue, plot turns and emotional beats, \
         in 800 to 1000 words.",
        setup = ctx.setup,
        outline = ctx.outline,
        ordinal = unit.ordinal,
        title = unit.title,
        excerpt = unit.excerpt,
        length = ctx.job.spec.length_per_unit(),
    );
    push_previous(&mut prompt, ctx.previous_content);

    ProduceRequest {
        job_id: ctx.job.id.clone(),
        phase: Phase::SubOutline,
        unit: Some(unit.ordinal),
        system_prompt: "You are an experienced outliner who turns chapter summaries into detailed writing plans.".into(),
        user_prompt: prompt,
        temperature: 0.7,
        max_output_tokens: 2000,
    }
}

pub fn sub_outline_check(ctx: UnitContext<'_>, plan: String, min_total: f64) -> EvaluateRequest {
    EvaluateRequest {
        job_id: ctx.job.id.clone(),
        phase: Phase::SubOutline,
        unit: Some(ctx.unit.ordinal),
        system_prompt: EDITOR_SYSTEM.into(),
        rubric: rubric(
            "Review this detailed chapter plan.",
            SUB_OUTLINE_CRITERIA,
            min_total,
        ),
        material: format!(
            "Setting:\n{}\n\nChapter summary:\n{}\n{}\n\nChapter plan:\n{plan}",
            ctx.setup, ctx.unit.title, ctx.unit.excerpt
        ),
        max_output_tokens: 1000,
    }
}

pub fn content_request(ctx: UnitContext<'_>, plan: &str) -> ProduceRequest {
    let unit = ctx.unit;
    let mut prompt = format!(
        "Write chapter {ordinal} of the novel.\n\n\
         Setting:\n{setup}\n\n\
         Chapter title: {title}\n\n\
         Chapter plan:\n{plan}\n\n\
         Write about {length} characters. Follow the plan closely, keep \
         sentences short and concrete, let verbs carry the description and \
         keep the dialogue natural.",
        ordinal = unit.ordinal,
        setup = ctx.setup,
        title = unit.title,
        length = ctx.job.spec.length_per_unit(),
    );
    push_previous(&mut prompt, ctx.previous_content);

    ProduceRequest {
        job_id: ctx.job.id.clone(),
        phase: Phase::Content,
        unit: Some(unit.ordinal),
        system_prompt: "You are a seasoned popular novelist. You write in short, concrete sentences and prefer verbs to adjectives.".into(),
        user_prompt: prompt,
        temperature: 0.8,
        max_output_tokens: 4000,
    }
}

pub fn content_check(ctx: UnitContext<'_>, plan: &str, content: String, min_total: f64) -> EvaluateRequest {
    EvaluateRequest {
        job_id: ctx.job.id.clone(),
        phase: Phase::Content,
        unit: Some(ctx.unit.ordinal),
        system_prompt: EDITOR_SYSTEM.into(),
        rubric: rubric(
            &format!(
                "Review this chapter. It should run to about {} characters.",
                ctx.job.spec.length_per_unit()
            ),
            CONTENT_CRITERIA,
            min_total,
        ),
        material: format!("Chapter plan:\n{plan}\n\nChapter text:\n{content}"),
        max_output_tokens: 1500,
    }
}

fn push_previous(prompt: &mut String, previous: Option<&str>) {
    if let Some(previous) = previous.filter(|p| !p.trim().is_empty()) {
        prompt.push_str("\n\nThe previous chapter ended like this:\n");
        prompt.push_str(tail(previous, CONTINUITY_TAIL_CHARS));
    }
}

/// The last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max_chars)
        .map_or(0, |(i, _)| i);
    &text[start..]
}

fn rubric(intro: &str, criteria: &[Criterion], min_total: f64) -> String {
    let mut out = format!("{intro}\n\nScore each criterion from 0 to 10:\n");
    for (i, c) in criteria.iter().enumerate() {
        out.push_str(&format!("{}. {}: {}\n", i + 1, c.key, c.question));
    }
    let scores = criteria
        .iter()
        .map(|c| format!("    \"{}\": <score>", c.key))
        .collect::<Vec<_>>()
        .join(",\n");
    out.push_str(&format!(
        "\nAnswer with JSON only:\n{{\n  \"scores\": {{\n{scores}\n  }},\n  \
         \"total_score\": <sum of the scores>,\n  \
         \"passed\": <true when total_score >= {min_total}>,\n  \
         \"issues\": [\"...\"],\n  \
         \"suggestions\": [\"...\"]\n}}"
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::UnitDescriptor;
    use crate::state_machine::JobSpec;

    fn job() -> Job {
        Job::new(JobSpec {
            title: "Salt".into(),
            theme: "loyalty".into(),
            background: "a fishing village".into(),
            target_length: 12_000,
            target_units: 4,
        })
    }

    fn unit() -> SubUnit {
        SubUnit::from(UnitDescriptor {
            ordinal: 2,
            title: "The Net".into(),
            excerpt: "Mara repairs the net.".into(),
        })
    }

    #[test]
    fn setup_request_carries_the_job_inputs() {
        let job = job();
        let req = setup_request(&job);
        assert_eq!(req.phase, Phase::Setup);
        assert_eq!(req.job_id, job.id);
        assert!(req.user_prompt.contains("Theme: loyalty"));
        assert!(req.user_prompt.contains("Target chapters: 4"));
        assert_eq!(req.max_output_tokens, 3000);
    }

    #[test]
    fn outline_request_asks_for_decomposable_headers() {
        let req = outline_request(&job(), "setting");
        assert!(req.user_prompt.contains("Chapter 1: <title>"));
        assert!(req.user_prompt.contains("exactly 4 chapters"));
    }

    #[test]
    fn rubric_lists_criteria_and_pass_line() {
        let req = sub_outline_check(
            UnitContext {
                job: &job(),
                unit: &unit(),
                setup: "setting",
                outline: "outline",
                previous_content: None,
            },
            "plan".into(),
            32.0,
        );
        assert!(req.rubric.contains("\"executable\": <score>"));
        assert!(req.rubric.contains("total_score >= 32"));
        assert!(req.material.ends_with("Chapter plan:\nplan"));
        assert_eq!(req.unit, Some(2));
    }

    #[test]
    fn unit_prompts_carry_the_previous_tail() {
        let job = job();
        let unit = unit();
        let previous = format!("{}THE END", "x".repeat(5_000));
        let ctx = UnitContext {
            job: &job,
            unit: &unit,
            setup: "setting",
            outline: "outline",
            previous_content: Some(&previous),
        };

        let req = content_request(ctx, "plan");
        assert!(req.user_prompt.contains("about 3000 characters"));
        assert!(req.user_prompt.ends_with("THE END"));
        assert!(!req.user_prompt.contains(&previous));

        let first = sub_outline_request(UnitContext {
            previous_content: None,
            ..ctx
        });
        assert!(!first.user_prompt.contains("previous chapter"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("第一章结束", 2), "结束");
        assert_eq!(tail("short", 10), "short");
    }
}
