//! Picks the roster entries a scene needs as visual references.
//!
//! Relevance is never stored; it is recomputed from the current roster and
//! scene text on every call so renames take effect immediately.

use std::collections::BTreeSet;

use folio_contracts::story::{Background, Character, Scene};
use regex::Regex;

/// Case-insensitive whole-word match of `name` inside `text`.
///
/// The name is matched literally; regex metacharacters in it carry no
/// meaning. Word edges are any non-word character or the ends of `text`,
/// so names that begin or end with punctuation still match.
pub fn matches_whole_word(text: &str, name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    let pattern = format!(r"(?i)(?:^|\W){}(?:\W|$)", regex::escape(name));
    match Regex::new(&pattern) {
        Ok(regex) => regex.is_match(text),
        Err(err) => {
            tracing::warn!(%name, error = %err, "name pattern rejected");
            false
        }
    }
}

/// True when either name is a case-insensitive prefix of the other.
pub fn names_prefix_match(left: &str, right: &str) -> bool {
    let left = left.trim().to_lowercase();
    let right = right.trim().to_lowercase();
    if left.is_empty() || right.is_empty() {
        return false;
    }
    left.starts_with(&right) || right.starts_with(&left)
}

fn normalized_location(scene: &Scene) -> Option<String> {
    scene
        .structured
        .as_ref()
        .and_then(|structured| structured.location.as_deref())
        .map(|location| location.trim().to_lowercase())
        .filter(|location| !location.is_empty())
}

fn structured_names(scene: &Scene) -> impl Iterator<Item = String> + '_ {
    scene
        .structured
        .iter()
        .flat_map(|structured| structured.characters.iter())
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
}

/// Characters to attach as references for `scene`.
///
/// `previous` is the scene immediately before it; when both share a
/// location its cast is carried over.
pub fn select_relevant_characters<'a>(
    scene: &Scene,
    previous: Option<&Scene>,
    roster: &'a [Character],
) -> Vec<&'a Character> {
    let mut candidates = structured_names(scene).collect::<BTreeSet<String>>();
    if let (Some(location), Some(previous)) = (normalized_location(scene), previous) {
        if normalized_location(previous).as_deref() == Some(location.as_str()) {
            candidates.extend(structured_names(previous));
        }
    }

    if !candidates.is_empty() {
        let matched = roster
            .iter()
            .filter(|character| {
                candidates
                    .iter()
                    .any(|candidate| names_prefix_match(&character.name, candidate))
            })
            .collect::<Vec<&Character>>();
        if !matched.is_empty() {
            return matched;
        }
    }

    roster
        .iter()
        .filter(|character| matches_whole_word(&scene.description, &character.name))
        .collect()
}

/// Backgrounds to attach as references for `scene`.
pub fn select_relevant_backgrounds<'a>(
    scene: &Scene,
    roster: &'a [Background],
) -> Vec<&'a Background> {
    if let Some(location) = normalized_location(scene) {
        let matched = roster
            .iter()
            .filter(|background| {
                let name = background.name.trim().to_lowercase();
                !name.is_empty() && location.contains(&name)
            })
            .collect::<Vec<&Background>>();
        if !matched.is_empty() {
            return matched;
        }
    }

    roster
        .iter()
        .filter(|background| matches_whole_word(&scene.description, &background.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use folio_contracts::data_url::DataUrl;
    use folio_contracts::story::StructuredSceneDescription;

    use super::*;

    fn roster(names: &[&str]) -> Vec<Character> {
        names.iter().map(|name| Character::new(*name)).collect()
    }

    fn backgrounds(names: &[&str]) -> Vec<Background> {
        names
            .iter()
            .map(|name| Background::new(*name, DataUrl::from_bytes("image/png", name.as_bytes())))
            .collect()
    }

    fn structured(characters: &[&str], location: Option<&str>) -> Scene {
        Scene::from_structured(StructuredSceneDescription {
            summary: "A scene".to_string(),
            characters: characters.iter().map(|name| name.to_string()).collect(),
            location: location.map(str::to_string),
            ..StructuredSceneDescription::default()
        })
    }

    fn names<T>(items: &[&T], name: impl Fn(&T) -> &str) -> Vec<String> {
        items.iter().map(|item| name(item).to_string()).collect()
    }

    #[test]
    fn plain_text_match_respects_word_boundaries() {
        let roster = roster(&["Kai", "Kairos"]);
        let scene = Scene::new("Kai draws his sword while Mira watches.");
        let selected = select_relevant_characters(&scene, None, &roster);
        assert_eq!(names(&selected, |c: &Character| c.name.as_str()), vec!["Kai"]);
    }

    #[test]
    fn whole_word_match_is_case_insensitive_and_literal() {
        assert!(matches_whole_word("KAI runs", "kai"));
        assert!(matches_whole_word("It was Dr. Who, again", "Dr. Who"));
        assert!(matches_whole_word("(R2-D2) beeps", "R2-D2"));
        assert!(matches_whole_word("Kai's blade", "Kai"));
        assert!(!matches_whole_word("Drx Who", "Dr. Who"));
        assert!(!matches_whole_word("a+b", "a.b"));
        assert!(matches_whole_word("sum a+b here", "a+b"));
        assert!(!matches_whole_word("anything", "   "));
    }

    #[test]
    fn structured_names_use_prefix_matching_both_ways() {
        let roster = roster(&["Katherine", "Tom", "Mira"]);
        let scene = structured(&["kate", "Thomas"], None);
        let selected = select_relevant_characters(&scene, None, &roster);
        assert!(selected.is_empty());

        let scene = structured(&["Kath", "Tom Hardy"], None);
        let selected = select_relevant_characters(&scene, None, &roster);
        assert_eq!(
            names(&selected, |c: &Character| c.name.as_str()),
            vec!["Katherine", "Tom"]
        );
    }

    #[test]
    fn structured_list_wins_over_description_text() {
        let roster = roster(&["Kai", "Mira"]);
        let mut scene = structured(&["Mira"], None);
        scene.description = "Kai waits for Mira".to_string();
        let selected = select_relevant_characters(&scene, None, &roster);
        assert_eq!(names(&selected, |c: &Character| c.name.as_str()), vec!["Mira"]);
    }

    #[test]
    fn structured_list_without_roster_match_falls_back_to_text() {
        let roster = roster(&["Kai"]);
        let mut scene = structured(&["The stranger"], None);
        scene.description = "Kai meets a stranger".to_string();
        let selected = select_relevant_characters(&scene, None, &roster);
        assert_eq!(names(&selected, |c: &Character| c.name.as_str()), vec!["Kai"]);
    }

    #[test]
    fn same_location_carries_previous_cast() {
        let roster = roster(&["Kai", "Mira"]);
        let previous = structured(&["Mira"], Some("Old Mill"));
        let scene = structured(&["Kai"], Some("  old mill "));
        let selected = select_relevant_characters(&scene, Some(&previous), &roster);
        assert_eq!(
            names(&selected, |c: &Character| c.name.as_str()),
            vec!["Kai", "Mira"]
        );

        let elsewhere = structured(&["Kai"], Some("harbour"));
        let selected = select_relevant_characters(&elsewhere, Some(&previous), &roster);
        assert_eq!(names(&selected, |c: &Character| c.name.as_str()), vec!["Kai"]);
    }

    #[test]
    fn background_matches_location_by_containment() {
        let roster = backgrounds(&["forest", "castle"]);
        let scene = structured(&[], Some("Forest at dusk"));
        let selected = select_relevant_backgrounds(&scene, &roster);
        assert_eq!(names(&selected, |b: &Background| b.name.as_str()), vec!["forest"]);

        let unrelated = structured(&[], Some("harbour market"));
        assert!(select_relevant_backgrounds(&unrelated, &roster).is_empty());
    }

    #[test]
    fn background_falls_back_to_description_words() {
        let roster = backgrounds(&["castle", "forest"]);
        let scene = Scene::new("They ride toward the castle gates.");
        let selected = select_relevant_backgrounds(&scene, &roster);
        assert_eq!(names(&selected, |b: &Background| b.name.as_str()), vec!["castle"]);

        let scene = Scene::new("The castles of the north.");
        assert!(select_relevant_backgrounds(&scene, &roster).is_empty());
    }

    #[test]
    fn prefix_match_ignores_blank_names() {
        assert!(names_prefix_match("Kath", "katherine"));
        assert!(!names_prefix_match("Kate", "Katherine"));
        assert!(!names_prefix_match("", "Kate"));
        assert!(!names_prefix_match("Kate", "Mira"));
    }
}
