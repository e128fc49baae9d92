// src/db/schema.rs
// DDL executed at startup. Statuses are TEXT with CHECK constraints rather
// than Postgres enum types so the queries stay plain-text bindable.

pub const DDL: &[&str] = &[
    // ---- public: transcript + threads ----
    r#"CREATE TABLE IF NOT EXISTS threads(
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        user_id text NOT NULL,
        title text NOT NULL DEFAULT 'New chat',
        archived boolean NOT NULL DEFAULT false,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS chat_log(
        id uuid PRIMARY KEY,
        user_id text,
        user_id_alias text,
        source text,
        text text,
        tags text[],
        thread_id uuid,
        vantage_id text,
        request_id text,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS chat_log_user_created_idx
        ON chat_log(user_id, created_at DESC)"#,
    r#"CREATE INDEX IF NOT EXISTS chat_log_thread_idx
        ON chat_log(thread_id, created_at)"#,

    // ---- public: answer traces + telemetry ----
    r#"CREATE TABLE IF NOT EXISTS vantage_answer_trace(
        answer_id uuid PRIMARY KEY,
        user_id text NOT NULL,
        thread_id uuid,
        vantage_id text,
        model_id text,
        answer_text text NOT NULL,
        answer_text_hash text,
        answer_text_len integer,
        memory_ids text[],
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS telemetry_event(
        event_id uuid PRIMARY KEY,
        event_type text NOT NULL,
        subject_type text NOT NULL,
        subject_id text NOT NULL,
        target_model_id text,
        target_model_version text,
        judge_model_id text,
        judge_model_version text,
        vantage_id text,
        condition_id text,
        thread_id text,
        turn_id text,
        actor_user_id text,
        payload jsonb NOT NULL DEFAULT '{}'::jsonb,
        occurred_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS telemetry_event_subject_idx
        ON telemetry_event(subject_type, subject_id, occurred_at)"#,

    // ---- vantage_identity: aliasing + retrieval policy ----
    "CREATE SCHEMA IF NOT EXISTS vantage_identity",
    r#"CREATE TABLE IF NOT EXISTS vantage_identity.user_alias(
        vantage_id text NOT NULL,
        alias_user_id text NOT NULL,
        canonical_user_id text NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        PRIMARY KEY (vantage_id, alias_user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_identity.rag_policy(
        vantage_id text PRIMARY KEY,
        policy jsonb NOT NULL DEFAULT '{}'::jsonb,
        updated_at timestamptz NOT NULL DEFAULT now()
    )"#,

    // ---- vantage_initiator: controller + jobs ----
    "CREATE SCHEMA IF NOT EXISTS vantage_initiator",
    r#"CREATE TABLE IF NOT EXISTS vantage_initiator.controller_config(
        vantage_id text PRIMARY KEY,
        enabled boolean NOT NULL DEFAULT true,
        tick_seconds integer NOT NULL DEFAULT 60,
        max_jobs_per_tick integer NOT NULL DEFAULT 3,
        max_running_jobs integer NOT NULL DEFAULT 2,
        daily_cost_budget_usd double precision NOT NULL DEFAULT 0.0,
        allowed_job_types jsonb NOT NULL DEFAULT '[]'::jsonb,
        updated_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_initiator.job(
        job_id bigserial PRIMARY KEY,
        vantage_id text NOT NULL,
        job_type text NOT NULL,
        payload jsonb NOT NULL DEFAULT '{}'::jsonb,
        priority integer NOT NULL DEFAULT 100,
        status text NOT NULL DEFAULT 'queued'
            CHECK (status IN ('queued','running','succeeded','failed')),
        attempts integer NOT NULL DEFAULT 0,
        max_attempts integer NOT NULL DEFAULT 3,
        scheduled_at timestamptz NOT NULL DEFAULT now(),
        locked_by text,
        locked_at timestamptz,
        last_error text,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS job_claim_idx
        ON vantage_initiator.job(vantage_id, status, priority, scheduled_at, job_id)"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_initiator.job_run(
        run_id bigserial PRIMARY KEY,
        job_id bigint NOT NULL REFERENCES vantage_initiator.job(job_id),
        worker_id text NOT NULL,
        started_at timestamptz NOT NULL DEFAULT now(),
        finished_at timestamptz,
        before_drives jsonb,
        after_drives jsonb,
        outcome jsonb,
        error text
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_initiator.drive_snapshot(
        snapshot_id bigserial PRIMARY KEY,
        vantage_id text NOT NULL,
        drives jsonb NOT NULL,
        notes text NOT NULL DEFAULT '',
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,

    // ---- vantage_fact: sources, entities, claims, evidence ----
    "CREATE SCHEMA IF NOT EXISTS vantage_fact",
    r#"CREATE TABLE IF NOT EXISTS vantage_fact.source(
        source_id bigserial PRIMARY KEY,
        source_type text NOT NULL,
        external_id text UNIQUE,
        title text,
        content text,
        content_sha256 text,
        metadata jsonb NOT NULL DEFAULT '{}'::jsonb,
        status text NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending','processing','done','error')),
        error text,
        processed_at timestamptz,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_fact.entity(
        entity_id bigserial PRIMARY KEY,
        entity_type text NOT NULL,
        canonical_name text NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS entity_name_idx
        ON vantage_fact.entity(entity_type, canonical_name)"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_fact.predicate(
        predicate text PRIMARY KEY,
        arg_schema jsonb NOT NULL DEFAULT '{}'::jsonb,
        description text,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_fact.claim(
        claim_id bigserial PRIMARY KEY,
        subject_entity_id bigint NOT NULL REFERENCES vantage_fact.entity(entity_id),
        predicate text NOT NULL REFERENCES vantage_fact.predicate(predicate),
        object_entity_id bigint,
        object_literal jsonb,
        qualifiers jsonb NOT NULL DEFAULT '{}'::jsonb,
        confidence double precision NOT NULL DEFAULT 0.5,
        status text NOT NULL DEFAULT 'active'
            CHECK (status IN ('active','retracted')),
        canonical_key text UNIQUE NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS claim_subject_idx
        ON vantage_fact.claim(subject_entity_id, predicate)"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_fact.evidence(
        evidence_id bigserial PRIMARY KEY,
        claim_id bigint NOT NULL REFERENCES vantage_fact.claim(claim_id),
        source_id bigint NOT NULL REFERENCES vantage_fact.source(source_id),
        span_start integer,
        span_end integer,
        snippet text,
        extractor text NOT NULL,
        extractor_version text NOT NULL,
        extraction_confidence double precision NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_fact.contradiction(
        contradiction_id bigserial PRIMARY KEY,
        subject_entity_id bigint NOT NULL,
        predicate text NOT NULL,
        qualifier_key text NOT NULL DEFAULT '',
        status text NOT NULL DEFAULT 'open'
            CHECK (status IN ('open','resolved')),
        description text,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_fact.contradiction_member(
        contradiction_id bigint NOT NULL REFERENCES vantage_fact.contradiction(contradiction_id),
        claim_id bigint NOT NULL REFERENCES vantage_fact.claim(claim_id),
        PRIMARY KEY (contradiction_id, claim_id)
    )"#,

    // ---- vantage_card: heads, revisions, links, signals ----
    "CREATE SCHEMA IF NOT EXISTS vantage_card",
    r#"CREATE TABLE IF NOT EXISTS vantage_card.card_head(
        card_id bigserial PRIMARY KEY,
        vantage_id text NOT NULL,
        kind text NOT NULL,
        topic_key text NOT NULL,
        summary text NOT NULL DEFAULT '',
        payload jsonb NOT NULL DEFAULT '{}'::jsonb,
        strength double precision NOT NULL DEFAULT 0.500,
        confidence double precision NOT NULL DEFAULT 0.500,
        status text NOT NULL DEFAULT 'active'
            CHECK (status IN ('active','retired')),
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now(),
        UNIQUE (vantage_id, kind, topic_key)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_card.card_revision(
        revision_id bigserial PRIMARY KEY,
        card_id bigint NOT NULL REFERENCES vantage_card.card_head(card_id),
        prev_revision_id bigint REFERENCES vantage_card.card_revision(revision_id),
        summary text NOT NULL DEFAULT '',
        payload jsonb NOT NULL DEFAULT '{}'::jsonb,
        reason text,
        delta jsonb NOT NULL DEFAULT '{}'::jsonb,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_card.card_link(
        card_id bigint NOT NULL REFERENCES vantage_card.card_head(card_id),
        link_type text NOT NULL,
        ref_id text NOT NULL,
        note text,
        created_at timestamptz NOT NULL DEFAULT now(),
        PRIMARY KEY (card_id, link_type, ref_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vantage_card.card_signal(
        signal_id bigserial PRIMARY KEY,
        vantage_id text NOT NULL,
        kind text NOT NULL,
        topic_key text NOT NULL,
        signal_type text NOT NULL
            CHECK (signal_type IN ('reward','punish','correction','use')),
        magnitude double precision NOT NULL DEFAULT 1.0,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS card_signal_topic_idx
        ON vantage_card.card_signal(vantage_id, kind, topic_key, created_at)"#,
];
