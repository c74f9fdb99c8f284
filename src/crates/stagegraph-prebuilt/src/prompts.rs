//! Instruction texts used by the pipeline's generation stages
//!
//! Each rendered prompt starts with one of these, so a
//! [`ScriptedGenerator`](crate::ScriptedGenerator) can answer by prefix.

pub const ANALYSIS: &str = "Analyze this game development request. Respond with a JSON object \
containing input_type, detected_engine (pygame|godot|bevy|none), completeness_score (0.0-1.0), \
needs_seeding, missing_information and suggested_processing \
(spec_generation|direct_routing|seeding_first).";

pub const SEEDING: &str = "Extract key themes, narrative elements and concepts from this game \
request for seeding. Respond with a JSON object containing literary_genres, historical_periods, \
character_archetypes, narrative_themes and artistic_styles.";

pub const SPECIFICATION: &str = "Generate a comprehensive game specification for this request. \
Respond with a JSON object containing title, description, engine (pygame|godot|bevy), genre, \
target_audience, features, art_style, complexity (simple|intermediate|complex), assets_needed \
and code_requirements.";

pub const CODE: &str = "Write the core game code for this specification.";

pub const GRAPHICS: &str = "Describe the graphics assets this game needs, one per line.";

pub const AUDIO: &str = "Describe the sound effects and music this game needs, one per line.";

pub const DIALOGUE_OUTLINE: &str = "Outline the dialogue scenes for this game.";

pub const DIALOGUE_LINES: &str = "Write the dialogue lines for this outline.";

pub const QUEST_OBJECTIVES: &str = "List the quest objectives for this game.";

pub const QUEST_REWARDS: &str = "Assign rewards to these quest objectives.";
