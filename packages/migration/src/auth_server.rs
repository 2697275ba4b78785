use crate::Migration;

pub(crate) static MIGRATIONS: &[Migration] = &[Migration::new(
    "create_users",
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name VARCHAR(100) NOT NULL UNIQUE,
        email VARCHAR(100) NOT NULL UNIQUE,
        password VARCHAR(100),
        verified BOOLEAN NOT NULL
    );
    "#,
)];
