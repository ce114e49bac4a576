use serde_json::{Value, json};

use crate::instruction::{ALLOWED_KEYS, EXTRACTABLE_FIELDS, MAX_STEPS};
use crate::milestone::Milestone;

const JSON_ONLY: &str = "Respond with JSON only: your entire reply must be a single JSON object matching the schema above. Do not wrap it in prose.";

pub fn reasoning_system_prompt() -> String {
    format!(
        "You are the planner of a browser automation that tracks ocean shipments.\n\nYou will be given a JSON snapshot of the automation context: the goal, the booking id and carrier, the current URL, the last achieved milestone, the remaining milestones in order, the last instruction and its result, recent history, extracted data, post-action vision notes and a knowledge base of workflow hints.\n\nDecide what the automation should do next:\n- `goal_achieved`: true only when both voyage_number and arrival_date are already extracted.\n- `next_milestone`: the label of the milestone to work on next, normally the first remaining one.\n- `vision_objective`: what a screenshot analyst should look for on the current page (empty when nothing needs to be located).\n- `language_instruction`: one concrete browser instruction that advances to `next_milestone`.\n- `reasoning` and `failure_analysis`: short free text.\n- `ad_recovery`: when the current page is an advertisement, a redirect or an unrelated site instead of the tracking flow, set `detected` true, a `recovery_url` on the hub site and the milestone label to `reset_to_milestone`.\n\nIf a `failure_alert` is present the previous approach is failing repeatedly: choose a different approach.\n\nSchema: {{\"goal_achieved\": bool, \"next_milestone\": string, \"vision_objective\": string, \"language_instruction\": string, \"reasoning\": string, \"failure_analysis\": string, \"ad_recovery\": {{\"detected\": bool, \"recovery_url\": string, \"reset_to_milestone\": string}}}}\n\n{JSON_ONLY}"
    )
}

pub fn reasoning_user_message(snapshot: &Value) -> String {
    format!("Automation context:\n{snapshot}")
}

pub fn vision_system_prompt(input_groups: bool) -> String {
    let schema = if input_groups {
        "{\"found\": bool, \"input_groups\": [{\"input\": {\"label\": string, \"x\": number, \"y\": number, \"confidence\": number}, \"submission\": {\"method\": \"enter_key\" | \"button_click\", \"button\": {\"label\": string, \"x\": number, \"y\": number, \"confidence\": number} | null, \"button_distance\": number | null, \"reasoning\": string}, \"relevance_score\": number, \"relevance_reasoning\": string}], \"elements\": [], \"notes\": string}"
    } else {
        "{\"found\": bool, \"elements\": [{\"label\": string, \"x\": number, \"y\": number, \"confidence\": number}], \"notes\": string}"
    };
    let focus = if input_groups {
        "Locate text inputs that accept a booking, B/L or container number. Pair each input with how it is submitted: the nearest search/track button, or the Enter key when no button is visible. Score how relevant each input is to shipment tracking between 0 and 1. Ignore login, newsletter and site-wide search boxes when a tracking form exists."
    } else {
        "Locate the elements that satisfy the objective. Report every visible value relevant to shipment tracking (vessel, voyage, arrival, ETA, discharge) in the element labels or notes exactly as displayed."
    };
    format!(
        "You analyse screenshots of web pages for a browser automation.\n\nYou will be given one screenshot (one viewport-sized fold of the page) and an objective. Coordinates are CSS pixels from the top-left corner of the screenshot and must point at the centre of the element.\n\n{focus}\n\nDescribe what the page is in `notes` (for example: carrier home page, tracking results, login page, error page, advertisement).\n\nSchema: {schema}\n\n{JSON_ONLY}"
    )
}

pub fn vision_user_message(objective: &str) -> String {
    format!("Objective: {objective}")
}

pub fn tab_confirmation_system_prompt() -> String {
    format!(
        "A click in a shipment tracking automation opened a new browser tab. Decide from its screenshot and URL whether the tab belongs to the tracking flow (the carrier website, its tracking page or its results) or is an advertisement, survey, promotion or unrelated site.\n\nSchema: {{\"legitimate\": bool, \"reasoning\": string}}\n\n{JSON_ONLY}"
    )
}

pub fn tab_confirmation_user_message(url: &str, carrier: &str) -> String {
    format!(
        "Carrier: {}\nNew tab URL: {url}",
        carrier.to_ascii_uppercase()
    )
}

pub fn language_system_prompt() -> String {
    format!(
        "You turn the planner's instruction into a decision for the action generator of a shipment tracking automation.\n\nYou will be given the automation context, the planner's decision, screenshot analyses of the current page and, when the page is a carrier directory, the visible text of the carrier link.\n\nDecide:\n- `needs_code`: whether a browser action is required to progress (false when the page already shows what the milestone needs).\n- `needs_vision`: whether element coordinates are still missing.\n- `instruction`: one precise instruction, referencing coordinates or visible text from the analyses when available.\n- `expected_outcome`: what the page should show afterwards.\n- `data_to_extract`: field names to read from the page, from: {}.\n\nSchema: {{\"needs_code\": bool, \"needs_vision\": bool, \"instruction\": string, \"expected_outcome\": string, \"data_to_extract\": [string]}}\n\n{JSON_ONLY}",
        EXTRACTABLE_FIELDS.join(", ")
    )
}

pub fn language_user_message(payload: &Value) -> String {
    format!("Decision input:\n{payload}")
}

pub fn generator_system_prompt() -> String {
    format!(
        "You write browser actions for a shipment tracking automation. Actions are a JSON document `{{\"steps\": [...]}}` with at most {MAX_STEPS} steps. Each step is one of:\n- {{\"op\": \"navigate\", \"url\": string}} (only hosts from the allowed list)\n- {{\"op\": \"click_at\", \"x\": number, \"y\": number, \"expect_new_tab\": bool}}\n- {{\"op\": \"click_text\", \"text\": string, \"expect_new_tab\": bool}}\n- {{\"op\": \"type\", \"text\": string, \"x\": number, \"y\": number, \"submit\": bool}} (x/y focus the input first; submit presses Enter)\n- {{\"op\": \"press_key\", \"key\": one of {}}}\n- {{\"op\": \"wait\", \"ms\": number}}\n- {{\"op\": \"extract\", \"field\": one of {}, \"label\": string}} (reads the value shown next to the label)\n- {{\"op\": \"dismiss_popups\"}}\n\nPrefer coordinates from the screenshot analyses. When an input group says the form is submitted with a button, click the button after typing instead of pressing Enter. Set `expect_new_tab` when a link on a directory page opens the carrier site.\n\n{JSON_ONLY}",
        ALLOWED_KEYS.join(", "),
        EXTRACTABLE_FIELDS.join(", ")
    )
}

pub fn generator_user_message(payload: &Value) -> String {
    format!("Generate the action for:\n{payload}")
}

pub fn rubric_system_prompt() -> String {
    format!(
        "You judge whether one step of a shipment tracking automation reached its milestone.\n\nYou will be given the milestone, the instruction that was executed, the URL before and after, whether execution succeeded (and its error) and a screenshot analysis of the page afterwards.\n\nJudge by category:\n- site reached: the URL or page content belongs to the expected site.\n- element found: the analysis shows the expected control.\n- form submitted: the page changed to a results or detail view after the query.\n- results displayed: tracking results are visible (voyage, vessel, arrival, ETA, route); login, error and empty pages are failures.\n- data extracted: the voyage number and arrival date are visible or were read.\n\nPartial errors inside the action do not fail a milestone whose goal evidently succeeded.\n\nSchema: {{\"success\": bool, \"reasoning\": string}}\n\n{JSON_ONLY}"
    )
}

pub fn rubric_user_message(payload: &Value) -> String {
    format!("Step outcome:\n{payload}")
}

pub fn extraction_system_prompt() -> String {
    format!(
        "You read shipment tracking results. From the screenshot analyses given, return the voyage number (vessel name with voyage code when both are shown) and the arrival date at the destination port exactly as displayed. Use an empty string for a value that is not present.\n\nSchema: {{\"voyage_number\": string, \"arrival_date\": string}}\n\n{JSON_ONLY}"
    )
}

pub fn extraction_user_message(payload: &Value) -> String {
    format!("Screenshot analyses:\n{payload}")
}

/// Static workflow hints handed to the planner with every snapshot.
pub fn knowledge_base(carrier: &str) -> Value {
    let carrier_upper = carrier.to_ascii_uppercase();
    let workflow: Vec<Value> = Milestone::ALL
        .iter()
        .map(|milestone| {
            json!({
                "id": milestone.id(),
                "label": milestone.label(carrier),
                "optional": milestone.is_optional(),
            })
        })
        .collect();

    json!({
        "workflow": workflow,
        "common_patterns": {
            "hub": "The hub site lists carriers; the carrier link usually opens the carrier website in a new tab.",
            "carrier_site": format!("The {carrier_upper} website may hide tracking under a services or e-service menu."),
            "tracking_form": "Tracking forms take a booking or B/L number and submit with a search/track button or Enter.",
            "results": "Results pages show vessel/voyage, route and arrival or ETA dates, often in a table.",
        },
        "guidelines": [
            "Work on the first remaining milestone.",
            "Dismiss cookie banners and popups before clicking underneath them.",
            "Prefer coordinates reported by the vision analysis.",
            "Never log in; tracking is public.",
        ],
        "recovery_strategies": {
            "advertisement_or_redirect": "Navigate back to the hub and restart from the hub milestone.",
            "input_not_found": "Scroll through the page or open the tracking section from the menu.",
            "no_results": "Check the booking id was typed completely and submit again.",
            "repeated_failures": "Switch to a different element or approach.",
        }
    })
}
