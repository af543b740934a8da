//! Change store and snapshot store database schema.

/// SQL to create the change log tables.
pub const CREATE_CHANGES_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS change_streams (
    aggregate_id     UUID PRIMARY KEY,
    aggregate_type   VARCHAR(255) NOT NULL,
    boxed            BOOLEAN NOT NULL DEFAULT FALSE,
    last_active_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_change_streams_expiry
    ON change_streams (aggregate_type, last_active_at)
    WHERE NOT boxed;

CREATE TABLE IF NOT EXISTS aggregate_changes (
    change_id       UUID PRIMARY KEY,
    aggregate_id    UUID NOT NULL REFERENCES change_streams (aggregate_id),
    aggregate_type  VARCHAR(255) NOT NULL,
    root_id         UUID,
    change_type     VARCHAR(255) NOT NULL,
    payload         JSONB NOT NULL,
    sequence_number BIGINT NOT NULL,
    correlation_id  UUID NOT NULL,
    causation_id    UUID NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    boxed           BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_aggregate_changes_live_sequence
    ON aggregate_changes (aggregate_id, sequence_number)
    WHERE NOT boxed;

CREATE INDEX IF NOT EXISTS idx_aggregate_changes_correlation_id
    ON aggregate_changes (correlation_id);
";

/// SQL to create the snapshot table.
pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS aggregate_snapshots (
    snapshot_id       BIGSERIAL PRIMARY KEY,
    aggregate_id      UUID NOT NULL,
    aggregate_type    VARCHAR(255) NOT NULL,
    root_id           UUID,
    aggregate_version BIGINT NOT NULL,
    state             BYTEA NOT NULL,
    taken_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    boxed             BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS idx_aggregate_snapshots_latest
    ON aggregate_snapshots (aggregate_id, boxed, snapshot_id DESC);
";
