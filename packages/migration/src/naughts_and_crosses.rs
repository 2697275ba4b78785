use crate::Migration;

pub(crate) static MIGRATIONS: &[Migration] = &[
    Migration::new(
        "create_games",
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            player1 UUID,
            player2 UUID,
            turn INT2,
            marks VARCHAR(9)
        );
        "#,
    ),
    Migration::new(
        "add_games_created_time",
        r#"
        ALTER TABLE games ADD COLUMN IF NOT EXISTS created_time TIMESTAMP;
        "#,
    ),
];
