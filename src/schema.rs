// testman schema - fixed tables for Diesel ORM
//
// Realm tables are declared at runtime by the registrar. The tables below
// have a fixed layout and are accessed through the typed DSL.

diesel::table! {
    wiki (name, version) {
        name -> Text,
        version -> Integer,
        time -> BigInt,
        author -> Text,
        ipnr -> Nullable<Text>,
        text -> Text,
        comment -> Nullable<Text>,
    }
}

diesel::table! {
    testconfig (propname) {
        propname -> Text,
        value -> Nullable<Text>,
    }
}

diesel::table! {
    testcasehistory (id, planid, time) {
        id -> Text,
        planid -> Text,
        time -> BigInt,
        author -> Nullable<Text>,
        status -> Nullable<Text>,
    }
}
