use paircast_proto::ClientId;

const ADJECTIVES: [&str; 32] = [
    "Amber", "Brisk", "Calm", "Daring", "Eager", "Fabled", "Gentle", "Hasty", "Ivory", "Jolly",
    "Keen", "Lucid", "Mellow", "Nimble", "Opal", "Placid", "Quiet", "Rustic", "Sly", "Tidy",
    "Umber", "Vivid", "Wry", "Zesty", "Bold", "Crisp", "Deft", "Fleet", "Glad", "Merry", "Prim",
    "Swift",
];

const NOUNS: [&str; 32] = [
    "Auk", "Badger", "Crane", "Dingo", "Egret", "Ferret", "Gannet", "Heron", "Ibis", "Jackal",
    "Kestrel", "Lemur", "Marten", "Newt", "Otter", "Plover", "Quail", "Raven", "Stoat", "Tapir",
    "Urchin", "Vole", "Wren", "Yak", "Bittern", "Civet", "Dunlin", "Fulmar", "Godwit", "Lynx",
    "Osprey", "Shrike",
];

/// Deterministic human label for a client: the same `client_id` always
/// maps to the same name, without the server keeping any naming state.
pub fn display_name(client_id: &ClientId) -> String {
    let digest = blake3::hash(client_id.as_bytes());
    let bytes = digest.as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{} {}", adjective, noun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn names_are_stable_per_client() {
        let id = Uuid::new_v4();
        assert_eq!(display_name(&id), display_name(&id));
    }

    #[test]
    fn names_have_two_words() {
        let name = display_name(&Uuid::new_v4());
        assert_eq!(name.split(' ').count(), 2);
    }
}
