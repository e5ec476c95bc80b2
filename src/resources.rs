//! Registry of the generic CRUD resources.
//!
//! Each [`Resource`] ties a URL segment to a table and the allow-list of
//! fields that may be written to it. Handlers and storage only ever build
//! SQL from these static descriptors.

use crate::auth::Role;
use crate::patch::Field;

/// A table exposed under `/api/<path>`.
#[derive(Debug)]
pub struct Resource {
    /// URL segment, e.g. `acoes-controle`.
    pub path: &'static str,
    /// Singular name used in error messages.
    pub label: &'static str,
    pub table: &'static str,
    /// Rows carry an `airport_id` and are filtered by the caller's airport.
    pub airport_scoped: bool,
    /// Column used by `startDate` / `endDate` list filters.
    pub date_column: Option<&'static str>,
    pub fields: &'static [Field],
    pub write_role: Role,
    pub delete_role: Role,
}

static COLISAO_FIELDS: &[Field] = &[
    Field::date("data").required(),
    Field::time("hora"),
    Field::integer("especie_id"),
    Field::integer("local_id"),
    Field::integer("fase_voo_id"),
    Field::integer("classe_dano_id"),
    Field::integer("condicao_tempo_id"),
    Field::text("categoria"),
    Field::text("tipo_incidente"),
    Field::real("peso_severidade").bounded(0.0, 5.0),
    Field::real("custo_brl").non_negative(),
    Field::text("aeronave"),
    Field::integer("altitude_pes").non_negative(),
    Field::text("notas"),
];

static AVISTAMENTO_FIELDS: &[Field] = &[
    Field::date("data").required(),
    Field::time("hora"),
    Field::integer("especie_id"),
    Field::integer("local_id"),
    Field::integer("quadrante_id"),
    Field::integer("condicao_tempo_id"),
    Field::integer("quantidade").non_negative(),
    Field::text_list("comportamentos"),
    Field::text("observacoes"),
];

static MOVIMENTO_FIELDS: &[Field] = &[
    Field::date("data").required(),
    Field::integer("pousos").non_negative(),
    Field::integer("decolagens").non_negative(),
    Field::text("observacoes"),
];

static ACAO_CONTROLE_FIELDS: &[Field] = &[
    Field::date("data").required(),
    Field::time("hora"),
    Field::text("tipo_acao").required(),
    Field::integer("especie_id"),
    Field::integer("local_id"),
    Field::text_list("metodos"),
    Field::integer("quantidade_dispersada").non_negative(),
    Field::text("resultado"),
    Field::text("observacoes"),
];

static CARCACA_FIELDS: &[Field] = &[
    Field::date("data").required(),
    Field::time("hora"),
    Field::integer("especie_id"),
    Field::integer("local_id"),
    Field::integer("quantidade").non_negative(),
    Field::text("estado"),
    Field::text("destino"),
    Field::integer("colisao_id"),
    Field::text("observacoes"),
];

static TREINAMENTO_FIELDS: &[Field] = &[
    Field::date("data").required(),
    Field::text("titulo").required(),
    Field::text("instrutor"),
    Field::real("carga_horaria").non_negative(),
    Field::text_list("participantes"),
    Field::text("observacoes"),
];

static LOCAL_FIELDS: &[Field] = &[
    Field::text("nome").required(),
    Field::text("tipo"),
    Field::real("latitude").bounded(-90.0, 90.0),
    Field::real("longitude").bounded(-180.0, 180.0),
    Field::integer("quadrante_id"),
];

static ESPECIE_FIELDS: &[Field] = &[
    Field::text("nome_popular").required(),
    Field::text("nome_cientifico"),
    Field::text("grupo"),
    Field::text("porte"),
    Field::real("peso_medio_kg").non_negative(),
];

/// Every resource served by the generic CRUD routes.
pub static RESOURCES: &[Resource] = &[
    Resource {
        path: "colisoes",
        label: "colisao",
        table: "fact_colisao",
        airport_scoped: true,
        date_column: Some("data"),
        fields: COLISAO_FIELDS,
        write_role: Role::Operador,
        delete_role: Role::Gestor,
    },
    Resource {
        path: "avistamentos",
        label: "avistamento",
        table: "fact_avistamento",
        airport_scoped: true,
        date_column: Some("data"),
        fields: AVISTAMENTO_FIELDS,
        write_role: Role::Operador,
        delete_role: Role::Gestor,
    },
    Resource {
        path: "movimentos",
        label: "movimento",
        table: "fact_movimento",
        airport_scoped: true,
        date_column: Some("data"),
        fields: MOVIMENTO_FIELDS,
        write_role: Role::Operador,
        delete_role: Role::Gestor,
    },
    Resource {
        path: "acoes-controle",
        label: "acao de controle",
        table: "fact_acao_controle",
        airport_scoped: true,
        date_column: Some("data"),
        fields: ACAO_CONTROLE_FIELDS,
        write_role: Role::Operador,
        delete_role: Role::Gestor,
    },
    Resource {
        path: "carcacas",
        label: "carcaca",
        table: "fact_carcaca",
        airport_scoped: true,
        date_column: Some("data"),
        fields: CARCACA_FIELDS,
        write_role: Role::Operador,
        delete_role: Role::Gestor,
    },
    Resource {
        path: "treinamentos",
        label: "treinamento",
        table: "fact_treinamento",
        airport_scoped: true,
        date_column: Some("data"),
        fields: TREINAMENTO_FIELDS,
        write_role: Role::Gestor,
        delete_role: Role::Gestor,
    },
    Resource {
        path: "locais",
        label: "local",
        table: "dim_local",
        airport_scoped: true,
        date_column: None,
        fields: LOCAL_FIELDS,
        write_role: Role::Gestor,
        delete_role: Role::Gestor,
    },
    Resource {
        path: "especies",
        label: "especie",
        table: "dim_especie",
        airport_scoped: false,
        date_column: None,
        fields: ESPECIE_FIELDS,
        write_role: Role::Gestor,
        delete_role: Role::Admin,
    },
];

/// Lookup tables readable through `/api/lookups/<name>`.
pub static LOOKUPS: &[(&str, &str)] = &[
    ("classe-dano", "lu_classe_dano"),
    ("fase-voo", "lu_fase_voo"),
    ("condicao-tempo", "lu_condicao_tempo"),
    ("quadrante", "lu_quadrante"),
];

pub fn find_resource(path: &str) -> Option<&'static Resource> {
    RESOURCES.iter().find(|r| r.path == path)
}

pub fn find_lookup(name: &str) -> Option<&'static str> {
    LOOKUPS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, table)| *table)
}
