//! Multimodal image requests.
//!
//! The generation request restates the reviewed prompt as numbered rules and
//! attaches every reference image with a labeled preamble, in a fixed order:
//! directive, art style, backgrounds, characters, aspect ratio.

use folio_contracts::data_url::DataUrl;
use folio_contracts::story::{
    has_shot_directive, ArtStyleReference, AspectRatio, Background, Character, Scene,
};

use crate::composer::locked_attributes;
use crate::model::{ImageRequest, Part};

/// Reference material for one scene, already filtered for relevance.
#[derive(Debug, Clone, Copy, Default)]
pub struct References<'a> {
    pub characters: &'a [&'a Character],
    pub backgrounds: &'a [&'a Background],
    pub art_style: Option<&'a ArtStyleReference>,
}

pub fn build_generation_request(scene: &Scene, prompt: &str, refs: References<'_>) -> ImageRequest {
    let mut parts = vec![Part::text(directive(scene, prompt, refs))];

    if let Some(style) = refs.art_style {
        let mut preamble = String::from(
            "ART STYLE REFERENCE: copy only the rendering technique of the next image (medium, \
             line work, colour application, shading). Ignore its subject; it does not describe \
             any character.",
        );
        if let Some(description) = style.effective_description() {
            preamble.push_str(&format!("\nTechnique notes: {}", flatten(&description)));
        }
        parts.push(Part::text(preamble));
        parts.push(Part::Image(style.image.clone()));
    }

    for background in refs.backgrounds {
        let mut preamble = format!(
            "BACKGROUND REFERENCE \"{}\": reuse this location's layout, lighting and palette.",
            background.name.trim()
        );
        if let Some(description) = background.effective_description() {
            preamble.push_str(&format!("\nLocation notes: {}", flatten(&description)));
        }
        parts.push(Part::text(preamble));
        parts.push(Part::Image(background.image.clone()));
    }

    for character in refs.characters {
        let Some(image) = character.image.as_ref() else {
            continue;
        };
        let mut preamble = format!(
            "CHARACTER REFERENCE \"{}\". CRITICAL: replicate exactly. Same face, hair colour and \
             style, eye colour, outfit and accessories as the next image. Only pose and \
             expression may change.",
            character.name.trim()
        );
        if let Some(analysis) = character.analysis.as_ref() {
            preamble.push_str(&format!("\nLocked: {}", locked_attributes(analysis)));
        }
        parts.push(Part::text(preamble));
        parts.push(Part::Image(image.clone()));
    }

    parts.push(Part::text(aspect_directive(scene.aspect_ratio)));

    ImageRequest {
        parts,
        aspect_ratio: Some(scene.aspect_ratio),
    }
}

fn directive(scene: &Scene, prompt: &str, refs: References<'_>) -> String {
    let mut text = format!(
        "Create one illustration for a novel.\n\nSCENE INSTRUCTIONS\n{}",
        prompt.trim()
    );
    if !has_shot_directive(prompt) {
        if let Some(instruction) = scene.shot_type.instruction() {
            text.push_str(&format!("\n\nCAMERA: {instruction}"));
        }
    }

    let mut rules = Vec::new();
    if refs.art_style.is_some() {
        rules.push(
            "Render in the technique of the art style reference; it never changes a character's \
             appearance.",
        );
    }
    if !refs.backgrounds.is_empty() {
        rules.push("Place the scene in the background reference location.");
    }
    if refs.characters.iter().any(|c| c.image.is_some()) {
        rules.push(
            "Every character with a reference image must match it exactly: identity, hair, eyes, \
             outfit and accessories.",
        );
    }
    rules.push("Do not add text, captions, speech bubbles or watermarks.");

    text.push_str("\n\nCONSISTENCY RULES");
    for (idx, rule) in rules.iter().enumerate() {
        text.push_str(&format!("\n{}. {rule}", idx + 1));
    }
    text
}

fn aspect_directive(ratio: AspectRatio) -> String {
    format!(
        "OUTPUT FORMAT: {} aspect ratio ({}).",
        ratio.ratio(),
        ratio.orientation()
    )
}

/// Request that alters an existing illustration while preserving the rest.
pub fn build_edit_request(image: &DataUrl, instruction: &str, ratio: AspectRatio) -> ImageRequest {
    ImageRequest {
        parts: vec![
            Part::Image(image.clone()),
            Part::text(format!(
                "Edit this illustration: {}\nKeep everything the instruction does not mention \
                 unchanged: characters, art style, composition and framing.",
                instruction.trim()
            )),
        ],
        aspect_ratio: Some(ratio),
    }
}

fn flatten(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<&str>>()
        .join("; ")
}
