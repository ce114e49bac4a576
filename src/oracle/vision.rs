//! Pure post-processing of vision results.

use super::types::VisionAnalysis;

const INPUT_OBJECTIVE_KEYWORDS: &[&str] = &[
    "input field",
    "text input",
    "booking id input",
    "b/l input",
    "container input",
    "enter booking",
    "enter the id",
    "input for booking",
];

const NON_INPUT_LABELS: &[&str] = &[
    "button",
    "login",
    "submit",
    "search button",
    "link",
    "icon",
    "logo",
    "menu",
    "dropdown",
    "select",
    "navigation",
];

const INPUT_LABELS: &[&str] = &[
    "input",
    "field",
    "text",
    "search",
    "booking",
    "b/l",
    "bl",
    "container",
    "cntr",
    "tracking",
    "reference",
];

/// Labels that justify keeping an undetected group on confidence alone.
pub const FALLBACK_INPUT_LABELS: &[&str] = &[
    "input",
    "field",
    "booking",
    "b/l",
    "bl",
    "container",
    "cntr",
    "search",
    "text",
];

/// Objectives asking for an input field get the richer `input_groups` schema.
pub fn is_input_objective(objective: &str) -> bool {
    let objective = objective.to_lowercase();
    INPUT_OBJECTIVE_KEYWORDS
        .iter()
        .any(|keyword| objective.contains(keyword))
}

/// Drop input groups whose label names a non-input control. Groups near the
/// top of the page (`y < 100`) survive without a keyword since header search
/// boxes are rarely labelled. When nothing survives, the proposals are kept
/// in `original_input_groups`.
pub fn filter_input_labels(analysis: &mut VisionAnalysis) {
    if analysis.input_groups.is_empty() {
        return;
    }
    let proposed = analysis.input_groups.clone();
    let original = proposed.len();
    analysis.input_groups.retain(|group| {
        let label = group.input.label.to_lowercase();
        if NON_INPUT_LABELS.iter().any(|keyword| label.contains(keyword)) {
            return false;
        }
        INPUT_LABELS.iter().any(|keyword| label.contains(keyword)) || group.input.y < 100.0
    });
    analysis.found = !analysis.input_groups.is_empty();
    if !analysis.found {
        analysis.original_input_groups = proposed;
    }
    let removed = original - analysis.input_groups.len();
    if removed > 0 {
        analysis
            .notes
            .push_str(&format!(" [Filtered: removed {removed} non-input elements]"));
    }
}

/// Shift fold-relative coordinates into page coordinates.
pub fn adjust_for_scroll(analysis: &mut VisionAnalysis, scroll_top: f64) {
    analysis.scroll_top = scroll_top;
    if scroll_top == 0.0 {
        return;
    }
    for element in &mut analysis.elements {
        element.y += scroll_top;
    }
    for group in analysis
        .input_groups
        .iter_mut()
        .chain(analysis.original_input_groups.iter_mut())
    {
        group.input.y += scroll_top;
        if let Some(button) = group.submission.button.as_mut() {
            button.y += scroll_top;
        }
    }
}

/// Whether a URL belongs to the hub (or a search engine) rather than a carrier.
pub fn is_hub_url(url: &str, hub_host: Option<&str>) -> bool {
    let url = url.to_lowercase();
    url.contains("google.com")
        || hub_host
            .map(|host| url.contains(&host.to_lowercase()))
            .unwrap_or(false)
}

/// On the hub, the label of the first element naming the carrier.
pub fn carrier_link_text(analyses: &[VisionAnalysis], carrier: &str) -> Option<String> {
    let carrier = carrier.to_lowercase();
    analyses
        .iter()
        .flat_map(|analysis| analysis.elements.iter())
        .find(|element| element.label.to_lowercase().contains(&carrier))
        .or_else(|| {
            analyses
                .iter()
                .flat_map(|analysis| analysis.elements.iter())
                .next()
        })
        .map(|element| element.label.clone())
}
