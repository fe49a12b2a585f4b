// lazytodo schema - entity, closure and operation log tables for Diesel ORM

diesel::table! {
    schema_version (version) {
        version -> Integer,
        applied_at -> Text,
    }
}

diesel::table! {
    workspaces (id) {
        id -> Text,
        name -> Text,
        position -> Integer,
        is_expanded -> Bool,
        created_at -> Text,
        updated_at -> Text,
        deleted_at -> Nullable<Text>,
    }
}

diesel::table! {
    workspace_closure (ancestor_id, descendant_id) {
        ancestor_id -> Text,
        descendant_id -> Text,
        depth -> Integer,
    }
}

diesel::table! {
    todos (id) {
        id -> Text,
        workspace_id -> Text,
        description -> Text,
        position -> Integer,
        status -> Text,
        urgency -> Integer,
        due_date -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
        completed_at -> Nullable<Text>,
        deleted_at -> Nullable<Text>,
        is_archived -> Bool,
    }
}

diesel::table! {
    todo_closure (ancestor_id, descendant_id) {
        ancestor_id -> Text,
        descendant_id -> Text,
        depth -> Integer,
    }
}

// ============================================================================
// Write-ahead operation log
// ============================================================================

diesel::table! {
    operation_log (id) {
        id -> BigInt,
        operation_type -> Text,
        entity_type -> Text,
        entity_id -> Text,
        payload -> Text,
        applied -> Bool,
        is_undone -> Bool,
        undone_at -> Nullable<Text>,
        undo_group_id -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::joinable!(todos -> workspaces (workspace_id));
diesel::allow_tables_to_appear_in_same_query!(workspaces, todos);
