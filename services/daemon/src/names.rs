//! Instance name generation.

use rand::seq::IndexedRandom;

/// Produces candidate names for instances created without one.
pub trait NameGenerator: Send + Sync {
    fn make_name(&self) -> String;
}

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "brisk", "calm", "clever", "crisp", "daring", "eager", "fancy", "gentle",
    "glad", "golden", "happy", "humble", "jolly", "keen", "lively", "lucky", "mellow", "merry",
    "nimble", "noble", "patient", "plucky", "proud", "quick", "quiet", "rapid", "sharp", "shiny",
    "snappy", "solid", "steady", "sunny", "swift", "tidy", "vivid", "warm", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beagle", "bison", "condor", "coyote", "crane", "dingo", "falcon", "ferret",
    "gecko", "gopher", "heron", "ibis", "impala", "jackal", "koala", "lemur", "lynx", "marmot",
    "marten", "mole", "newt", "ocelot", "otter", "panda", "puffin", "quail", "raven", "salmon",
    "seal", "shrew", "stoat", "swift", "tapir", "toucan", "vole", "walrus", "wombat", "yak",
    "zebra",
];

/// Generates `adjective-noun` names.
#[derive(Debug, Default)]
pub struct PetNameGenerator;

impl NameGenerator for PetNameGenerator {
    fn make_name(&self) -> String {
        let mut rng = rand::rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("brisk");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("heron");
        format!("{adjective}-{noun}")
    }
}

/// Always returns the same name.
#[derive(Debug, Clone)]
pub struct FixedNameGenerator(pub String);

impl NameGenerator for FixedNameGenerator {
    fn make_name(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::validate_name;

    #[test]
    fn test_pet_names_are_valid_instance_names() {
        let generator = PetNameGenerator;
        for _ in 0..100 {
            let name = generator.make_name();
            assert!(validate_name(&name).is_ok(), "{name}");
            assert_eq!(name.split('-').count(), 2);
        }
    }

    #[test]
    fn test_fixed_name() {
        let generator = FixedNameGenerator("pied-piper-valley".to_string());
        assert_eq!(generator.make_name(), "pied-piper-valley");
    }
}
