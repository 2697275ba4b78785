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
            created_time TIMESTAMP,
            finished BOOLEAN
        );
        "#,
    ),
    Migration::new(
        "create_pieces",
        r#"
        CREATE TABLE IF NOT EXISTS pieces (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            game UUID,
            x INT2,
            y INT2,
            player INT2,
            king BOOLEAN
        );

        CREATE INDEX IF NOT EXISTS pieces_game_idx ON pieces (game);
        "#,
    ),
];
