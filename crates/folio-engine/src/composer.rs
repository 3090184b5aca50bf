//! Human-readable prompt preview for one scene.
//!
//! The preview is what a reviewer reads and edits before any image is
//! requested. Section order is fixed: scene and shot, character
//! references, art style, setting, closing checklist.

use folio_contracts::analysis::CharacterAnalysis;
use folio_contracts::story::{Background, Character, Scene, ShotType};

pub fn compose_prompt(
    scene: &Scene,
    characters: &[&Character],
    backgrounds: &[&Background],
    art_style_description: Option<&str>,
    shot_type: ShotType,
) -> String {
    let mut sections = Vec::new();

    let mut opening = format!("Scene: {}", scene.description.trim());
    if let Some(directive) = shot_type.directive() {
        opening.push('\n');
        opening.push_str(&directive);
    }
    sections.push(opening);

    if !characters.is_empty() {
        let mut block = String::from(
            "CHARACTER REFERENCES\nEach character's appearance is LOCKED. Reproduce hair, eyes, \
             outfit and accessories exactly as described; do not restyle them for this scene.",
        );
        for character in characters {
            block.push_str("\n\n");
            block.push_str(&character_entry(character));
        }
        sections.push(block);
    }

    if let Some(style) = art_style_description
        .map(str::trim)
        .filter(|style| !style.is_empty())
    {
        sections.push(format!(
            "ART STYLE (technique only)\n{style}\nThis governs rendering, line work, colour \
             application and shading ONLY. It must NOT be read as describing any character: \
             hair colour, eye colour, clothing and accessories come from the character \
             references, never from the style."
        ));
    }

    if !backgrounds.is_empty() {
        let mut block = String::from("SETTING");
        for background in backgrounds {
            let description = background
                .effective_description()
                .map(|text| one_line(&text))
                .unwrap_or_else(|| "match the background reference image".to_string());
            block.push_str(&format!("\n- {}: {description}", background.name.trim()));
        }
        sections.push(block);
    }

    if !characters.is_empty() {
        let setting_rule = if backgrounds.is_empty() {
            "The setting follows the scene description."
        } else {
            "The setting follows the SETTING block."
        };
        sections.push(format!(
            "FINAL CHECK\n1. Character identity is locked: same face, hair, eyes, outfit and \
             accessories as the references.\n2. The art style informs technique only.\n3. {setting_rule}"
        ));
    }

    sections.join("\n\n")
}

fn character_entry(character: &Character) -> String {
    let mut entry = format!("{}:", character.name.trim());
    if let Some(analysis) = character.analysis.as_ref() {
        entry.push_str(&format!("\nLocked: {}", locked_attributes(analysis)));
    }
    match character.effective_description() {
        Some(description) => entry.push_str(&format!("\nAppearance: {}", one_line(&description))),
        None => entry.push_str(&format!(
            "\nWARNING: no description for {}; rely on the reference image alone.",
            character.name.trim()
        )),
    }
    if character.image.is_none() {
        entry.push_str(&format!(
            "\nWARNING: no reference image for {}; follow the written description.",
            character.name.trim()
        ));
    }
    entry
}

/// Attributes that must survive every generation of a character.
pub fn locked_attributes(analysis: &CharacterAnalysis) -> String {
    let hair = &analysis.hair;
    let mut parts = vec![
        format!("hair {}, {}, {}", hair.color, hair.length, hair.style),
        format!(
            "eyes {} ({}, {})",
            analysis.face.eyes.color, analysis.face.eyes.shape, analysis.face.eyes.size
        ),
        format!(
            "outfit {} over {}",
            analysis.outfit.upper_body, analysis.outfit.lower_body
        ),
    ];
    let accessories = analysis
        .outfit
        .accessories
        .iter()
        .chain(hair.accessories.iter())
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .collect::<Vec<&str>>();
    if !accessories.is_empty() {
        parts.push(format!("accessories {}", accessories.join(", ")));
    }
    parts.join("; ")
}

/// Legacy descriptions are multi-line; prompts keep each entry on one line.
fn one_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<&str>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use folio_contracts::data_url::DataUrl;

    use super::*;
    use crate::testing::character_json;

    fn kai() -> Character {
        let mut kai = Character::new("Kai");
        kai.image = Some(DataUrl::from_bytes("image/png", b"kai"));
        kai.analysis = serde_json::from_value(character_json()).ok();
        kai
    }

    #[test]
    fn scene_only_prompt_has_no_reference_blocks() {
        let scene = Scene::new("A storm rolls over the bay.");
        let prompt = compose_prompt(&scene, &[], &[], None, ShotType::Automatic);
        assert_eq!(prompt, "Scene: A storm rolls over the bay.");
    }

    #[test]
    fn shot_type_becomes_composition_instruction() {
        let scene = Scene::new("Kai waits.");
        let prompt = compose_prompt(&scene, &[], &[], None, ShotType::CloseUp);
        assert!(prompt.contains("Shot (close-up): Compose this as a close-up"));
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let scene = Scene::new("Kai enters the forest.");
        let kai = kai();
        let forest = Background::new("forest", DataUrl::from_bytes("image/png", b"forest"));
        let prompt = compose_prompt(
            &scene,
            &[&kai],
            &[&forest],
            Some("Watercolour washes with ink outlines"),
            ShotType::Wide,
        );
        let order = ["Scene:", "CHARACTER REFERENCES", "ART STYLE", "SETTING", "FINAL CHECK"]
            .iter()
            .map(|marker| prompt.find(marker).unwrap_or(usize::MAX))
            .collect::<Vec<usize>>();
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{order:?}");
        assert!(prompt.contains("Locked: hair jet black, shoulder length, loose waves"));
        assert!(prompt.contains("accessories leather satchel"));
        assert!(prompt.contains("must NOT be read as describing any character"));
        assert!(prompt.contains("- forest: match the background reference image"));
        assert!(prompt.contains("3. The setting follows the SETTING block."));
    }

    #[test]
    fn missing_image_and_description_are_flagged() {
        let scene = Scene::new("Mira hides.");
        let mira = Character::new("Mira");
        let prompt = compose_prompt(&scene, &[&mira], &[], None, ShotType::Automatic);
        assert!(prompt.contains("WARNING: no description for Mira"));
        assert!(prompt.contains("WARNING: no reference image for Mira"));
        assert!(prompt.contains("3. The setting follows the scene description."));
    }

    #[test]
    fn checklist_only_when_characters_present() {
        let scene = Scene::new("Empty hall.");
        let hall = Background::new("hall", DataUrl::from_bytes("image/png", b"hall"));
        let prompt = compose_prompt(&scene, &[], &[&hall], Some("ink"), ShotType::Automatic);
        assert!(!prompt.contains("FINAL CHECK"));
        assert!(prompt.contains("ART STYLE"));
    }
}
