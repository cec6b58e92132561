use crate::types::BoardTemplate;

/// A column created when a board is started from a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateColumn {
    pub title: &'static str,
    pub color: &'static str,
    pub description: Option<&'static str>,
}

const fn col(title: &'static str, color: &'static str, description: &'static str) -> TemplateColumn {
    TemplateColumn {
        title,
        color,
        description: Some(description),
    }
}

const MAD_SAD_GLAD: &[TemplateColumn] = &[
    col("Mad", "#B8072F", "What frustrated you?"),
    col("Sad", "#004F71", "What disappointed you?"),
    col("Glad", "#077E4C", "What made you happy?"),
];

const LIKED_LEARNED_LACKED: &[TemplateColumn] = &[
    col("Liked", "#249E6B", "What did you enjoy?"),
    col("Learned", "#3EB1C8", "What did you learn?"),
    col("Lacked", "#E33205", "What was missing?"),
];

const START_STOP_CONTINUE: &[TemplateColumn] = &[
    col("Start", "#077E4C", "What should we begin doing?"),
    col("Stop", "#B8072F", "What should we stop doing?"),
    col("Continue", "#004F71", "What should we keep doing?"),
];

const WENT_WELL_DIDNT_ACTION: &[TemplateColumn] = &[
    col("What Went Well", "#249E6B", "Celebrate successes"),
    col("What Didn't Go Well", "#E33205", "Identify challenges"),
    col("Action Items", "#004F71", "Plan improvements"),
];

const CUSTOM: &[TemplateColumn] = &[
    TemplateColumn {
        title: "Column 1",
        color: "#004F71",
        description: None,
    },
    TemplateColumn {
        title: "Column 2",
        color: "#249E6B",
        description: None,
    },
    TemplateColumn {
        title: "Column 3",
        color: "#E33205",
        description: None,
    },
];

impl BoardTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            BoardTemplate::MadSadGlad => "Mad / Sad / Glad",
            BoardTemplate::LikedLearnedLacked => "Liked / Learned / Lacked",
            BoardTemplate::StartStopContinue => "Start / Stop / Continue",
            BoardTemplate::WentWellDidntAction => "Went Well / Didn't Go Well / Action Items",
            BoardTemplate::Custom => "Custom Board",
        }
    }

    /// Columns in the order they are created.
    pub fn columns(&self) -> &'static [TemplateColumn] {
        match self {
            BoardTemplate::MadSadGlad => MAD_SAD_GLAD,
            BoardTemplate::LikedLearnedLacked => LIKED_LEARNED_LACKED,
            BoardTemplate::StartStopContinue => START_STOP_CONTINUE,
            BoardTemplate::WentWellDidntAction => WENT_WELL_DIDNT_ACTION,
            BoardTemplate::Custom => CUSTOM,
        }
    }
}
